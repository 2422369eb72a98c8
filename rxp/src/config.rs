//! Protocol configuration

use crate::error::{Result, RxpError};
use rxp_protocol::segment::{MAX_SEGMENT_PAYLOAD, MSS};
use std::net::SocketAddr;
use std::time::Duration;

/// UDP port the datagram transport binds to by default
pub const DEFAULT_UDP_PORT: u16 = 15000;

/// Conventional address of the relay used as first hop
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:13000";

/// Tunables shared by every connection of one demultiplexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxpConfig {
    /// Local UDP port of the transport
    pub udp_port: u16,
    /// UDP port datagrams are sent to on the peer's host when no first hop
    /// is configured
    pub peer_udp_port: u16,
    /// Relay every datagram is sent through, if any
    pub first_hop: Option<SocketAddr>,
    /// Maximum payload bytes per segment
    pub mss: usize,
    /// Receive buffer capacity in bytes (the advertised window)
    pub recv_buffer_size: usize,
    /// Send buffer capacity in segments
    pub send_buffer_segments: usize,
    /// Default accept queue length for listeners
    pub backlog: usize,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Time budget for the opening handshake
    pub connect_timeout: Duration,
    /// Time budget for an orderly close
    pub close_timeout: Duration,
    /// How long a fully closed connection lingers to re-acknowledge a
    /// retransmitted CYA
    pub last_wait: Duration,
    /// Initial slow start threshold in bytes
    pub initial_threshold: usize,
}

impl Default for RxpConfig {
    fn default() -> Self {
        RxpConfig {
            udp_port: DEFAULT_UDP_PORT,
            peer_udp_port: DEFAULT_UDP_PORT,
            first_hop: None,
            mss: MSS,
            recv_buffer_size: 32 * 1024,
            send_buffer_segments: 256,
            backlog: 16,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(30),
            last_wait: Duration::from_secs(2),
            initial_threshold: 64 * MSS,
        }
    }
}

impl RxpConfig {
    /// Configuration sending everything through the relay at `first_hop`
    pub fn with_first_hop(first_hop: SocketAddr) -> Self {
        RxpConfig {
            first_hop: Some(first_hop),
            ..Default::default()
        }
    }

    /// Reject tunables a connection cannot work with
    ///
    /// Every segment must fit in one datagram and in an empty receive
    /// buffer, otherwise it could never be delivered.
    pub fn validate(&self) -> Result<()> {
        if self.mss == 0 || self.mss > MAX_SEGMENT_PAYLOAD {
            return Err(RxpError::InvalidConfig(format!(
                "mss {} is outside 1..={}",
                self.mss, MAX_SEGMENT_PAYLOAD
            )));
        }
        if self.recv_buffer_size < self.mss {
            return Err(RxpError::InvalidConfig(format!(
                "recv_buffer_size {} is smaller than mss {}",
                self.recv_buffer_size, self.mss
            )));
        }
        if self.min_rto > self.max_rto {
            return Err(RxpError::InvalidConfig("min_rto exceeds max_rto".into()));
        }
        Ok(())
    }

    /// Advertised window, saturated to what the header can carry
    pub fn advertised_window(&self) -> u16 {
        self.recv_buffer_size.min(u16::MAX as usize) as u16
    }
}
