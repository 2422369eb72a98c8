//! Congestion Control for RxP
//!
//! Window-based control measured in bytes. The window grows by one MSS per
//! new acknowledgment while in slow start and by roughly one MSS per window
//! of acknowledgments in congestion avoidance. A detected loss halves the
//! threshold and collapses the window.

/// Congestion control phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionPhase {
    SlowStart,
    CongestionAvoidance,
}

/// Congestion controller state
#[derive(Debug, Clone)]
pub struct CongestionController {
    /// Congestion window (bytes)
    window: usize,
    /// Slow start threshold (bytes)
    threshold: usize,
    mss: usize,
    phase: CongestionPhase,
}

impl CongestionController {
    /// Create a new congestion controller
    ///
    /// # Arguments
    /// * `mss` - Maximum segment size in bytes
    /// * `initial_threshold` - Slow start threshold in bytes
    pub fn new(mss: usize, initial_threshold: usize) -> Self {
        let mut cc = CongestionController {
            window: 1,
            threshold: initial_threshold.max(1),
            mss: mss.max(1),
            phase: CongestionPhase::SlowStart,
        };
        cc.update_phase();
        cc
    }

    /// Current congestion window in bytes
    pub fn window(&self) -> usize {
        self.window
    }

    /// Current slow start threshold in bytes
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn phase(&self) -> CongestionPhase {
        self.phase
    }

    pub fn is_slow_start(&self) -> bool {
        self.phase == CongestionPhase::SlowStart
    }

    /// Record an acknowledgment that advanced the send window
    pub fn got_new_ack(&mut self) {
        match self.phase {
            CongestionPhase::SlowStart => {
                self.window += self.mss;
            }
            CongestionPhase::CongestionAvoidance => {
                let increment = (self.mss * self.mss) / self.window;
                self.window += increment.max(1);
            }
        }
        self.update_phase();

        tracing::trace!(
            "cwnd={} ssthresh={} phase={:?}",
            self.window,
            self.threshold,
            self.phase
        );
    }

    /// Record a retransmission timeout
    pub fn report_missing_packet(&mut self) {
        self.threshold = (self.window / 2).max(1);
        self.window = 1;
        self.update_phase();

        tracing::debug!(
            "Loss detected, cwnd reset to {} (ssthresh={})",
            self.window,
            self.threshold
        );
    }

    /// Bytes that may be outstanding: `max(min(peer_window, cwnd), 1)`
    pub fn send_quota(&self, peer_window: usize) -> usize {
        peer_window.min(self.window).max(1)
    }

    fn update_phase(&mut self) {
        self.phase = if self.window <= self.threshold {
            CongestionPhase::SlowStart
        } else {
            CongestionPhase::CongestionAvoidance
        };
    }
}
