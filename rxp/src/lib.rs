//! RxP - Reliable Transport over UDP
//!
//! TCP-like connections (ordered, flow- and congestion-controlled byte
//! streams) carried in UDP datagrams. One [`Demultiplexer`] per process owns
//! the datagram transport; any number of [`RxpSocket`]s share it.
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! let demux = rxp::initial_setup(15000, None)?;
//! let socket = rxp::RxpSocket::new(&demux);
//! socket.connect("10.0.0.2:80".parse::<SocketAddr>()?)?;
//! socket.send_all(b"hello world")?;
//! socket.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod connection;

pub mod config;
pub mod error;
pub mod protocol;
pub mod socket;
pub mod stats;

pub use rxp_io as io;
pub use rxp_protocol as proto;

pub use config::{RxpConfig, DEFAULT_RELAY_ADDR, DEFAULT_UDP_PORT};
pub use error::{Result, RxpError};
pub use protocol::{ConnectionId, Demultiplexer, SegmentHandler};
pub use rxp_protocol::{ConnectionState, Segment, SeqNumber, MSS};
pub use socket::RxpSocket;
pub use stats::ConnectionStats;

use rxp_io::UdpTransport;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set once a UDP-backed network has been opened in this process
static NETWORK_OPEN: AtomicBool = AtomicBool::new(false);

/// Open the network on `udp_port`, sending through `first_hop` if given
///
/// A process opens its network once: a second call fails with
/// [`RxpError::AlreadyOpen`]. A call that fails (for example because the
/// port is in use) does not count. Hosts built directly with
/// [`Demultiplexer::new`] are not limited.
pub fn initial_setup(udp_port: u16, first_hop: Option<SocketAddr>) -> Result<Arc<Demultiplexer>> {
    let config = RxpConfig {
        udp_port,
        first_hop,
        ..Default::default()
    };
    setup_with_config(config)
}

/// Open the network with explicit tunables
///
/// Subject to the same once-per-process rule as [`initial_setup`].
pub fn setup_with_config(config: RxpConfig) -> Result<Arc<Demultiplexer>> {
    if NETWORK_OPEN.swap(true, Ordering::AcqRel) {
        return Err(RxpError::AlreadyOpen);
    }

    let result = open_udp(config);
    if result.is_err() {
        NETWORK_OPEN.store(false, Ordering::Release);
    }
    result
}

fn open_udp(config: RxpConfig) -> Result<Arc<Demultiplexer>> {
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.udp_port));
    let transport = UdpTransport::bind(bind_addr)?;

    let demux = Demultiplexer::new(config, Arc::new(transport))?;
    demux.open()?;
    Ok(demux)
}
