//! Connection state machine
//!
//! Everything a connection knows lives in one [`Tcb`] behind a mutex, paired
//! with a condition variable that is notified after every change. Inbound
//! segments arrive on the demultiplexer's receive thread, retransmission
//! and release timers fire on the timer thread, and blocking socket calls
//! wait on the condition variable.

use crate::config::RxpConfig;
use crate::protocol::{ConnectionId, Demultiplexer, SegmentHandler};
use crate::socket::RxpSocket;
use crate::stats::ConnectionStats;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rxp_io::TimerHandle;
use rxp_protocol::{
    codec, CongestionController, ConnectionState, ReceiveBuffer, RtoEstimator, Segment, SendBuffer, SeqNumber,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Transmission control block
pub(crate) struct Tcb {
    pub(crate) state: ConnectionState,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) send_buf: Option<SendBuffer>,
    pub(crate) recv_buf: Option<ReceiveBuffer>,
    /// Our initial sequence number (the one our YO consumed)
    pub(crate) isn: SeqNumber,
    /// Sequence number of our CYA once queued
    pub(crate) cya_seq: Option<SeqNumber>,
    /// Peer's CYA has been accepted
    pub(crate) peer_fin: bool,
    /// Closed by a timeout or abort rather than an orderly close
    pub(crate) failed: bool,
    pub(crate) ack_due: bool,
    pub(crate) peer_window: usize,
    pub(crate) congestion: CongestionController,
    pub(crate) rto: RtoEstimator,
    retransmit_timer: Option<TimerHandle>,
    retransmit_gen: u64,
    release_timer: Option<TimerHandle>,
    release_gen: u64,
    pub(crate) listener: Option<Listener>,
    /// Bound for blocking accept/recv/send_all calls
    pub(crate) timeout: Option<Duration>,
    pub(crate) stats: ConnectionStats,
}

impl Tcb {
    pub(crate) fn new(config: &RxpConfig) -> Self {
        Tcb {
            state: ConnectionState::Open,
            local: None,
            peer: None,
            send_buf: None,
            recv_buf: None,
            isn: SeqNumber::default(),
            cya_seq: None,
            peer_fin: false,
            failed: false,
            ack_due: false,
            peer_window: config.mss,
            congestion: CongestionController::new(config.mss, config.initial_threshold),
            rto: RtoEstimator::new(config.initial_rto, config.min_rto, config.max_rto),
            retransmit_timer: None,
            retransmit_gen: 0,
            release_timer: None,
            release_gen: 0,
            listener: None,
            timeout: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Snapshot of the statistics with live controller values filled in
    pub(crate) fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        stats.retransmissions = self.send_buf.as_ref().map_or(0, SendBuffer::retransmissions);
        stats.rto = self.rto.rto();
        stats.srtt = self.rto.srtt();
        stats.congestion_window = self.congestion.window();
        stats.state = Some(self.state);
        stats
    }

    fn advertised_window(&self, config: &RxpConfig) -> u16 {
        self.recv_buf
            .as_ref()
            .map_or(config.advertised_window(), ReceiveBuffer::advertised_window)
    }

    fn own_cya_acked(&self) -> bool {
        match (self.cya_seq, &self.send_buf) {
            (Some(seq), Some(buf)) => buf.last_ack().ge(seq.next()),
            _ => false,
        }
    }

    fn has_outstanding(&self) -> bool {
        self.send_buf.as_ref().map_or(false, |buf| !buf.is_empty())
    }
}

/// Listener-only state
pub(crate) struct Listener {
    backlog: usize,
    half_open: HashMap<SocketAddr, HalfOpen>,
    next_gen: u64,
    pub(crate) accept_queue: VecDeque<(RxpSocket, SocketAddr)>,
}

impl Listener {
    pub(crate) fn new(backlog: usize) -> Self {
        Listener {
            backlog: backlog.max(1),
            half_open: HashMap::new(),
            next_gen: 0,
            accept_queue: VecDeque::new(),
        }
    }
}

/// Handshake in progress on a listener
struct HalfOpen {
    client_isn: SeqNumber,
    server_isn: SeqNumber,
    started: Instant,
    rto: Duration,
    gen: u64,
    timer: Option<TimerHandle>,
}

/// State shared between a socket handle, the receive thread and timers
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) demux: Arc<Demultiplexer>,
    pub(crate) tcb: Mutex<Tcb>,
    pub(crate) changed: Condvar,
    me: Weak<Shared>,
}

impl Shared {
    pub(crate) fn new(demux: &Arc<Demultiplexer>, tcb: Tcb) -> Arc<Shared> {
        let id = demux.next_connection_id();
        Arc::new_cyclic(|me| Shared {
            id,
            demux: Arc::clone(demux),
            tcb: Mutex::new(tcb),
            changed: Condvar::new(),
            me: me.clone(),
        })
    }

    /// Registry entry for this connection
    pub(crate) fn handler(&self) -> Weak<dyn SegmentHandler> {
        self.me.clone()
    }

    pub(crate) fn config(&self) -> &RxpConfig {
        self.demux.config()
    }

    /// Block until `done` holds or `deadline` passes
    ///
    /// Returns the final value of `done`.
    pub(crate) fn wait_until<F>(&self, tcb: &mut MutexGuard<'_, Tcb>, deadline: Option<Instant>, mut done: F) -> bool
    where
        F: FnMut(&Tcb) -> bool,
    {
        while !done(&**tcb) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(tcb, deadline).timed_out() {
                        return done(&**tcb);
                    }
                }
                None => self.changed.wait(tcb),
            }
        }
        true
    }

    /// Send whatever the windows allow
    ///
    /// Sends segments not yet transmitted (or marked by a rewind) from the
    /// front of the send buffer while their payload fits in
    /// `max(min(peer window, cwnd), 1)` bytes, or a bare ACK if one is due
    /// and nothing else goes out. The peer's window is never overrun; the
    /// congestion window always admits one segment. The retransmission
    /// timer is re-armed when `rearm` is set, when data leaves an idle
    /// connection, or when none is pending, and cancelled once nothing is
    /// outstanding.
    pub(crate) fn flush(&self, tcb: &mut Tcb, rearm: bool) {
        self.send_window(tcb, rearm, false);
    }

    /// `flush`, optionally forcing out the front segment when the peer's
    /// window has no room for it
    fn send_window(&self, tcb: &mut Tcb, mut rearm: bool, force_front: bool) {
        let Some(peer) = tcb.peer else { return };
        let window = tcb.advertised_window(self.config());
        let ack = tcb.recv_buf.as_ref().map(ReceiveBuffer::expected_seq);
        let quota = tcb.congestion.send_quota(tcb.peer_window);
        let peer_window = tcb.peer_window;

        let Some(buf) = tcb.send_buf.as_mut() else { return };
        let mut allowed = buf.segments_within(quota);
        if allowed == 0 && (force_front || buf.segments_within(peer_window) > 0) {
            allowed = 1;
        }

        let was_idle = !buf.has_in_flight();
        let mut segments = if allowed > 0 {
            buf.take_unsent(ack.is_some(), ack.unwrap_or_default(), window, allowed)
        } else {
            Vec::new()
        };
        rearm |= was_idle && !segments.is_empty();

        if let Some(ack) = ack {
            if segments.is_empty() && tcb.ack_due {
                segments.push(buf.ack_segment(ack, window));
            }
            if !segments.is_empty() {
                tcb.ack_due = false;
            }
        }

        for segment in &segments {
            transmit(&self.demux, &mut tcb.stats, peer, segment);
        }

        let timer_allowed = !matches!(tcb.state, ConnectionState::LastWait | ConnectionState::Closed);
        if !tcb.has_outstanding() || !timer_allowed {
            tcb.retransmit_timer = None;
        } else if rearm || tcb.retransmit_timer.is_none() {
            self.arm_retransmit(tcb);
        }
    }

    fn arm_retransmit(&self, tcb: &mut Tcb) {
        tcb.retransmit_gen += 1;
        let gen = tcb.retransmit_gen;
        let me = self.me.clone();

        tcb.retransmit_timer = Some(self.demux.schedule(tcb.rto.rto(), move || {
            if let Some(shared) = me.upgrade() {
                shared.on_retransmit_timeout(gen);
            }
        }));
    }

    fn on_retransmit_timeout(&self, gen: u64) {
        let mut tcb = self.tcb.lock();
        if tcb.retransmit_gen != gen {
            return;
        }
        tcb.retransmit_timer = None;

        let resendable = !matches!(
            tcb.state,
            ConnectionState::Open
                | ConnectionState::Listen
                | ConnectionState::YoRcvd
                | ConnectionState::LastWait
                | ConnectionState::Closed
        );
        if !resendable || !tcb.has_outstanding() {
            return;
        }

        tracing::debug!(
            "Connection {} retransmission timeout in {} (rto {:?})",
            self.id,
            tcb.state,
            tcb.rto.rto()
        );

        // With nothing in flight the timer was only waiting for the peer's
        // window to open, so nothing was lost
        let in_flight = tcb.send_buf.as_ref().map_or(false, SendBuffer::has_in_flight);
        if in_flight && !tcb.state.is_handshaking() {
            tcb.congestion.report_missing_packet();
        }
        tcb.rto.backoff();
        if let Some(buf) = tcb.send_buf.as_mut() {
            buf.rewind();
        }
        self.send_window(&mut tcb, true, !in_flight);
        self.changed.notify_all();
    }

    /// Enter LAST_WAIT, or restart its timer if already there
    ///
    /// The timer keeps the connection alive until it fires so a dropped
    /// socket still answers a retransmitted CYA.
    fn enter_last_wait(&self, tcb: &mut Tcb) {
        let Some(me) = self.me.upgrade() else { return };
        if tcb.state != ConnectionState::LastWait {
            tracing::debug!("Connection {} {} -> LAST_WAIT", self.id, tcb.state);
            tcb.state = ConnectionState::LastWait;
        } else if tcb.release_timer.is_some() {
            tracing::debug!("Connection {} restarting LAST_WAIT timer", self.id);
        }
        tcb.retransmit_timer = None;
        tcb.release_gen += 1;
        let gen = tcb.release_gen;

        tcb.release_timer = Some(self.demux.schedule(self.config().last_wait, move || {
            let mut tcb = me.tcb.lock();
            if tcb.state == ConnectionState::LastWait && tcb.release_gen == gen {
                me.finish(&mut tcb);
                me.changed.notify_all();
            }
        }));
    }

    /// Move to CLOSED and drop every route
    ///
    /// Handshakes and connections still queued on a listener are aborted.
    pub(crate) fn finish(&self, tcb: &mut Tcb) {
        if tcb.state == ConnectionState::Closed {
            return;
        }

        tracing::info!("Connection {} {} -> CLOSED", self.id, tcb.state);
        tcb.state = ConnectionState::Closed;
        tcb.retransmit_timer = None;
        tcb.release_timer = None;
        self.demux.deregister(self.id);

        if let Some(listener) = tcb.listener.as_mut() {
            listener.half_open.clear();
            for (child, peer) in listener.accept_queue.drain(..) {
                tracing::debug!("Aborting unaccepted connection from {}", peer);
                child.shared.abort();
            }
        }
    }

    /// Close after a liveness failure
    pub(crate) fn fail(&self, tcb: &mut Tcb) {
        tcb.failed = true;
        self.finish(tcb);
    }

    pub(crate) fn abort(&self) {
        let mut tcb = self.tcb.lock();
        self.fail(&mut tcb);
        self.changed.notify_all();
    }

    fn on_ack(&self, tcb: &mut Tcb, ack_num: SeqNumber) -> bool {
        let Some(buf) = tcb.send_buf.as_mut() else { return false };
        let outcome = buf.notify_ack(ack_num);
        if !outcome.is_new() {
            return false;
        }

        if let Some(sample) = outcome.rtt_sample {
            tcb.rto.update(sample);
        }
        tcb.congestion.got_new_ack();
        true
    }

    fn on_peer_cya(&self, tcb: &mut Tcb) {
        tcb.peer_fin = true;
        match tcb.state {
            ConnectionState::Established => {
                tracing::debug!("Connection {} ESTABLISHED -> CLOSE_WAIT", self.id);
                tcb.state = ConnectionState::CloseWait;
            }
            ConnectionState::CyaWait => self.enter_last_wait(tcb),
            // CYA_SENT remembers the peer's CYA until ours is acknowledged
            _ => {}
        }
    }

    /// Segment for a connection that has sent its YO
    fn on_segment(&self, tcb: &mut Tcb, segment: Segment) {
        tcb.stats.segments_received += 1;
        tcb.peer_window = segment.window() as usize;

        if tcb.state == ConnectionState::YoSent {
            if !segment.is_yo() {
                tracing::debug!("Connection {} ignoring {} in YO_SENT", self.id, segment);
                return;
            }
            // The listener's YO fixes the peer's sequence numbers
            let capacity = self.config().recv_buffer_size;
            tcb.recv_buf = Some(ReceiveBuffer::new(segment.seq().next(), capacity));
            tcb.state = ConnectionState::SynYoAckSent;
            tracing::debug!("Connection {} YO_SENT -> SYN_YO_ACK_SENT", self.id);
            self.resend(tcb);
            return;
        }

        let new_ack = segment.is_ack() && self.on_ack(tcb, segment.ack_num());

        match tcb.state {
            ConnectionState::SynYoAckSent if segment.is_yo() => {
                // Our YO+ACK was lost
                self.resend(tcb);
                return;
            }
            ConnectionState::SynYoAckSent => {
                let yo_acked = tcb.send_buf.as_ref().map_or(false, |buf| buf.last_ack().ge(tcb.isn.next()));
                if yo_acked {
                    tracing::info!(
                        "Connection {} established with {}",
                        self.id,
                        tcb.peer.map_or_else(String::new, |peer| peer.to_string())
                    );
                    tcb.state = ConnectionState::Established;
                }
            }
            ConnectionState::CyaSent if tcb.own_cya_acked() => {
                if tcb.peer_fin {
                    self.enter_last_wait(tcb);
                } else {
                    tracing::debug!("Connection {} CYA_SENT -> CYA_WAIT", self.id);
                    tcb.state = ConnectionState::CyaWait;
                }
            }
            ConnectionState::LastWord if tcb.own_cya_acked() => {
                self.finish(tcb);
                return;
            }
            _ => {}
        }

        if segment.seq_len() > 0 && tcb.state != ConnectionState::SynYoAckSent {
            tcb.ack_due = true;
            let accepted = tcb.recv_buf.as_mut().map_or(false, |buf| buf.put(&segment));

            if accepted {
                tcb.stats.bytes_received += segment.payload.len() as u64;
                if segment.is_cya() {
                    self.on_peer_cya(tcb);
                }
            } else {
                tcb.stats.dropped_segments += 1;
                tracing::trace!(
                    "Connection {} dropping {} (expecting {:?})",
                    self.id,
                    segment,
                    tcb.recv_buf.as_ref().map(ReceiveBuffer::expected_seq)
                );
                if segment.is_cya() && tcb.state == ConnectionState::LastWait {
                    // Our final ACK was lost
                    self.enter_last_wait(tcb);
                }
            }
        }

        self.flush(tcb, new_ack);
    }

    /// Resend the window from the front
    fn resend(&self, tcb: &mut Tcb) {
        if let Some(buf) = tcb.send_buf.as_mut() {
            buf.rewind();
        }
        self.flush(tcb, true);
    }

    /// Segment for a listening connection
    fn on_listener_segment(&self, tcb: &mut Tcb, peer: SocketAddr, segment: Segment) {
        let Some(local) = tcb.local else { return };
        let window = tcb.advertised_window(self.config());
        let Some(listener) = tcb.listener.as_mut() else { return };

        if !segment.is_yo() {
            tracing::debug!("Listener {} ignoring {} from {}", self.id, segment, peer);
            return;
        }
        tcb.stats.segments_received += 1;

        if !segment.is_ack() {
            if let Some(entry) = listener.half_open.get(&peer) {
                // Our YO was lost
                let yo = listener_yo(local, peer, entry.server_isn, window);
                transmit(&self.demux, &mut tcb.stats, peer, &yo);
                return;
            }

            if listener.accept_queue.len() >= listener.backlog {
                tracing::debug!("Listener {} queue full, ignoring YO from {}", self.id, peer);
                return;
            }

            let server_isn = SeqNumber::new(rand::random());
            listener.next_gen += 1;
            let gen = listener.next_gen;
            let rto = self.config().initial_rto;
            let timer = self.arm_half_open(peer, gen, rto);
            listener.half_open.insert(
                peer,
                HalfOpen {
                    client_isn: segment.seq(),
                    server_isn,
                    started: Instant::now(),
                    rto,
                    gen,
                    timer: Some(timer),
                },
            );

            let yo = listener_yo(local, peer, server_isn, window);
            transmit(&self.demux, &mut tcb.stats, peer, &yo);

            if tcb.state == ConnectionState::Listen {
                tracing::debug!("Listener {} LISTEN -> YO_RCVD", self.id);
                tcb.state = ConnectionState::YoRcvd;
            }
            return;
        }

        let Some(entry) = listener.half_open.get(&peer) else {
            tracing::debug!("Listener {} got {} from {} with no handshake", self.id, segment, peer);
            return;
        };
        if segment.seq() != entry.client_isn || segment.ack_num() != entry.server_isn.next() {
            tracing::debug!("Listener {} rejecting {} from {}", self.id, segment, peer);
            return;
        }

        let Some(mut entry) = listener.half_open.remove(&peer) else { return };
        if let Some(timer) = entry.timer.as_mut() {
            timer.cancel();
        }
        let child = RxpSocket::spawn_child(
            &self.demux,
            local,
            peer,
            entry.server_isn.next(),
            entry.client_isn.next(),
            segment.window() as usize,
        );
        listener.accept_queue.push_back((child, peer));
        tracing::info!("Listener {} accepted handshake from {}", self.id, peer);

        if listener.half_open.is_empty() {
            tcb.state = ConnectionState::Listen;
        }
    }

    fn arm_half_open(&self, peer: SocketAddr, gen: u64, delay: Duration) -> TimerHandle {
        let me = self.me.clone();
        self.demux.schedule(delay, move || {
            if let Some(shared) = me.upgrade() {
                shared.on_half_open_timeout(peer, gen);
            }
        })
    }

    fn on_half_open_timeout(&self, peer: SocketAddr, gen: u64) {
        let config = self.config();
        let mut guard = self.tcb.lock();
        let tcb = &mut *guard;
        let Some(local) = tcb.local else { return };
        let window = tcb.advertised_window(config);
        let Some(listener) = tcb.listener.as_mut() else { return };
        let Some(entry) = listener.half_open.get_mut(&peer) else { return };
        if entry.gen != gen {
            return;
        }

        if entry.started.elapsed() >= config.connect_timeout {
            listener.half_open.remove(&peer);
            tracing::debug!("Listener {} handshake with {} expired", self.id, peer);
            if listener.half_open.is_empty() && tcb.state == ConnectionState::YoRcvd {
                tcb.state = ConnectionState::Listen;
            }
            return;
        }

        entry.rto = entry.rto.saturating_mul(2).min(config.max_rto);
        let yo = listener_yo(local, peer, entry.server_isn, window);
        let delay = entry.rto;
        entry.timer = Some(self.arm_half_open(peer, gen, delay));
        transmit(&self.demux, &mut tcb.stats, peer, &yo);
    }
}

impl SegmentHandler for Shared {
    fn handle_segment(&self, peer: SocketAddr, segment: Segment) {
        let mut guard = self.tcb.lock();
        let tcb = &mut *guard;

        match tcb.state {
            ConnectionState::Listen | ConnectionState::YoRcvd => self.on_listener_segment(tcb, peer, segment),
            ConnectionState::Open | ConnectionState::Closed => {
                tracing::debug!("Connection {} in {} ignoring {}", self.id, tcb.state, segment);
            }
            _ if tcb.peer != Some(peer) => {
                tracing::debug!("Connection {} ignoring {} from stranger {}", self.id, segment, peer);
            }
            _ => self.on_segment(tcb, segment),
        }

        self.changed.notify_all();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.demux.deregister(self.id);
    }
}

fn listener_yo(local: SocketAddr, peer: SocketAddr, server_isn: SeqNumber, window: u16) -> Segment {
    let mut yo = codec::control_segment(
        local.port(),
        peer.port(),
        server_isn,
        SeqNumber::default(),
        true,
        false,
        false,
    );
    yo.set_window(window);
    codec::compute_checksum(yo)
}

fn transmit(demux: &Demultiplexer, stats: &mut ConnectionStats, peer: SocketAddr, segment: &Segment) {
    stats.segments_sent += 1;
    if let Err(e) = demux.send(peer, segment) {
        tracing::warn!("Send to {} failed: {}", peer, e);
    }
}
