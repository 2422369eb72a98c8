//! Datagram transport abstraction

use crate::socket::SocketError;
use std::net::SocketAddr;
use std::time::Duration;

/// How long a blocking receive waits before reporting that nothing arrived
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Largest datagram a transport is expected to deliver
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Unreliable datagram service
///
/// Datagrams may be lost, duplicated or reordered. Implementations must not
/// call back into the caller; delivery happens only through
/// [`DatagramTransport::receive_datagram`].
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to `dest`
    fn send_datagram(&self, dest: SocketAddr, data: &[u8]) -> Result<usize, SocketError>;

    /// Wait for one datagram
    ///
    /// Returns `Ok(None)` when nothing arrived within the poll interval so a
    /// receive loop can check whether it should stop.
    fn receive_datagram(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError>;

    /// Address this transport receives on
    fn local_addr(&self) -> Result<SocketAddr, SocketError>;
}
