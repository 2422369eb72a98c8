//! UDP transport for RxP
//!
//! Wraps a UDP socket configured through `socket2`. Receives block for at
//! most the poll interval.

use crate::transport::{DatagramTransport, DEFAULT_POLL_INTERVAL};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is closed")]
    Closed,
}

/// UDP datagram transport
pub struct UdpTransport {
    inner: UdpSocket,
}

impl UdpTransport {
    /// Create a UDP transport bound to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        Self::bind_with_poll_interval(addr, DEFAULT_POLL_INTERVAL)
    }

    /// Create a UDP transport whose receives give up after `poll_interval`
    pub fn bind_with_poll_interval(addr: SocketAddr, poll_interval: Duration) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(poll_interval))?;

        tracing::debug!("UDP transport bound to {}", addr);

        Ok(UdpTransport { inner: socket.into() })
    }
}

impl DatagramTransport for UdpTransport {
    fn send_datagram(&self, dest: SocketAddr, data: &[u8]) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(data, dest)?)
    }

    fn receive_datagram(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, addr))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            // ICMP port unreachable from an earlier send surfaces here on some platforms
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }
}
