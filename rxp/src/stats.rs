//! Per-connection statistics

use rxp_protocol::ConnectionState;
use std::time::Duration;

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Total segments handed to the transport
    pub segments_sent: u64,
    /// Total valid segments received
    pub segments_received: u64,
    /// Segments sent more than once
    pub retransmissions: u64,
    /// Application bytes accepted for sending
    pub bytes_sent: u64,
    /// Application bytes received in order
    pub bytes_received: u64,
    /// Out-of-order, duplicate or oversized segments discarded
    pub dropped_segments: u64,
    /// Current retransmission timeout
    pub rto: Duration,
    /// Current congestion window (bytes)
    pub congestion_window: usize,
    /// Smoothed round-trip time, once measured
    pub srtt: Option<Duration>,
    pub state: Option<ConnectionState>,
}
