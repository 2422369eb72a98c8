//! RxP sockets
//!
//! A blocking, TCP-like socket API over the demultiplexer. Every call takes
//! the connection lock, updates its state, flushes and (for blocking calls)
//! waits on the connection's condition variable.

use crate::connection::{Listener, Shared, Tcb};
use crate::error::{Result, RxpError};
use crate::protocol::Demultiplexer;
use crate::stats::ConnectionStats;
use bytes::Bytes;
use parking_lot::MutexGuard;
use rxp_protocol::{BufferError, ConnectionState, Flags, ReceiveBuffer, SendBuffer, SeqNumber};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One end of an RxP connection (or a listener)
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct RxpSocket {
    pub(crate) shared: Arc<Shared>,
}

impl RxpSocket {
    /// Create an unbound socket on `demux`
    pub fn new(demux: &Arc<Demultiplexer>) -> Self {
        let tcb = Tcb::new(demux.config());
        RxpSocket {
            shared: Shared::new(demux, tcb),
        }
    }

    /// Create the connection a listener hands out from `accept`
    ///
    /// The child starts ESTABLISHED, shares the listener's local address,
    /// has its own route for `peer` and acknowledges the peer's YO+ACK
    /// immediately.
    pub(crate) fn spawn_child(
        demux: &Arc<Demultiplexer>,
        local: SocketAddr,
        peer: SocketAddr,
        send_base: SeqNumber,
        recv_expected: SeqNumber,
        peer_window: usize,
    ) -> RxpSocket {
        let config = demux.config();
        let mut tcb = Tcb::new(config);
        tcb.state = ConnectionState::Established;
        tcb.local = Some(local);
        tcb.peer = Some(peer);
        tcb.isn = send_base - 1;
        tcb.send_buf = Some(SendBuffer::new(
            local.port(),
            peer.port(),
            send_base,
            config.send_buffer_segments,
            config.mss,
        ));
        tcb.recv_buf = Some(ReceiveBuffer::new(recv_expected, config.recv_buffer_size));
        tcb.peer_window = peer_window;
        tcb.ack_due = true;

        let shared = Shared::new(demux, tcb);
        demux.register_peer(shared.id, shared.handler(), local.port(), peer);
        {
            let mut tcb = shared.tcb.lock();
            shared.flush(&mut tcb, false);
        }

        RxpSocket { shared }
    }

    fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.shared.tcb.lock()
    }

    /// Bind to a local port; port 0 picks a free one
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let mut tcb = self.lock();
        if tcb.local.is_some() {
            return Err(RxpError::AlreadyBound);
        }
        if tcb.state != ConnectionState::Open {
            return Err(RxpError::InvalidState {
                op: "bind",
                state: tcb.state,
            });
        }

        let port = if addr.port() == 0 { None } else { Some(addr.port()) };
        let ip = if addr.ip().is_unspecified() {
            self.shared.demux.local_ip()
        } else {
            addr.ip()
        };
        self.bind_locked(&mut tcb, ip, port)
    }

    fn bind_locked(&self, tcb: &mut Tcb, ip: std::net::IpAddr, port: Option<u16>) -> Result<()> {
        let shared = &self.shared;
        let port = shared.demux.register(shared.id, shared.handler(), port)?;
        tcb.local = Some(SocketAddr::new(ip, port));
        tracing::debug!("Connection {} bound to {}", shared.id, SocketAddr::new(ip, port));
        Ok(())
    }

    fn ensure_bound(&self, tcb: &mut Tcb) -> Result<SocketAddr> {
        if tcb.local.is_none() {
            self.bind_locked(tcb, self.shared.demux.local_ip(), None)?;
        }
        tcb.local.ok_or(RxpError::NotConnected)
    }

    /// Start accepting connections, queueing at most `backlog` (0 uses the
    /// configured default)
    pub fn listen(&self, backlog: usize) -> Result<()> {
        let mut tcb = self.lock();
        if tcb.state != ConnectionState::Open {
            return Err(RxpError::InvalidState {
                op: "listen",
                state: tcb.state,
            });
        }

        let local = self.ensure_bound(&mut tcb)?;
        let backlog = if backlog == 0 {
            self.shared.config().backlog
        } else {
            backlog
        };
        tcb.listener = Some(Listener::new(backlog));
        tcb.state = ConnectionState::Listen;

        tracing::info!("Connection {} listening on {}", self.shared.id, local);
        Ok(())
    }

    /// Open a connection to `addr`, blocking until the handshake completes
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        let shared = &self.shared;
        let config = shared.config();
        let mut tcb = self.lock();
        if tcb.state != ConnectionState::Open {
            return Err(RxpError::InvalidState {
                op: "connect",
                state: tcb.state,
            });
        }

        let local = self.ensure_bound(&mut tcb)?;
        shared.demux.register_peer(shared.id, shared.handler(), local.port(), addr);

        let isn = SeqNumber::new(rand::random());
        let mut send_buf = SendBuffer::new(local.port(), addr.port(), isn, config.send_buffer_segments, config.mss);
        send_buf.put_control(Flags::YO)?;

        tcb.peer = Some(addr);
        tcb.isn = isn;
        tcb.send_buf = Some(send_buf);
        tcb.state = ConnectionState::YoSent;
        tracing::info!("Connection {} connecting {} -> {}", shared.id, local, addr);
        shared.flush(&mut tcb, false);

        let deadline = Instant::now() + config.connect_timeout;
        shared.wait_until(&mut tcb, Some(deadline), |tcb| !tcb.state.is_handshaking());

        match tcb.state {
            ConnectionState::Closed => Err(RxpError::ConnectionFailed(addr)),
            state if state.is_handshaking() => {
                tracing::warn!("Connection {} handshake with {} timed out", shared.id, addr);
                shared.fail(&mut tcb);
                shared.changed.notify_all();
                Err(RxpError::ConnectionFailed(addr))
            }
            _ => Ok(()),
        }
    }

    /// Wait for the next completed handshake
    pub fn accept(&self) -> Result<(RxpSocket, SocketAddr)> {
        let mut tcb = self.lock();
        match tcb.state {
            ConnectionState::Listen | ConnectionState::YoRcvd => {}
            ConnectionState::Closed => return Err(RxpError::Closed),
            state => return Err(RxpError::InvalidState { op: "accept", state }),
        }

        let deadline = tcb.timeout.map(|timeout| Instant::now() + timeout);
        self.shared.wait_until(&mut tcb, deadline, |tcb| {
            !tcb.state.is_listening() || tcb.listener.as_ref().map_or(true, |l| !l.accept_queue.is_empty())
        });

        if !tcb.state.is_listening() {
            return Err(RxpError::Closed);
        }
        tcb.listener
            .as_mut()
            .and_then(|listener| listener.accept_queue.pop_front())
            .ok_or(RxpError::TimedOut)
    }

    fn check_can_send(tcb: &Tcb, op: &'static str) -> Result<()> {
        match tcb.state {
            state if state.can_send() => Ok(()),
            ConnectionState::Closed => Err(RxpError::Closed),
            ConnectionState::Open
            | ConnectionState::Listen
            | ConnectionState::YoRcvd
            | ConnectionState::YoSent
            | ConnectionState::SynYoAckSent => Err(RxpError::NotConnected),
            state => Err(RxpError::InvalidState { op, state }),
        }
    }

    /// Queue as much of `data` as fits in the send buffer
    ///
    /// Returns the number of bytes queued, or [`RxpError::WouldBlock`] if
    /// the buffer is full.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let mut tcb = self.lock();
        Self::check_can_send(&tcb, "send")?;
        if data.is_empty() {
            return Ok(0);
        }

        let buf = tcb.send_buf.as_mut().ok_or(RxpError::NotConnected)?;
        let n = match buf.put(data) {
            Ok(n) => n,
            Err(BufferError::Full) => return Err(RxpError::WouldBlock),
        };
        tcb.stats.bytes_sent += n as u64;
        self.shared.flush(&mut tcb, false);
        Ok(n)
    }

    /// Queue all of `data`, blocking while the send buffer is full
    pub fn send_all(&self, data: &[u8]) -> Result<()> {
        let mut tcb = self.lock();
        let deadline = tcb.timeout.map(|timeout| Instant::now() + timeout);
        let mut offset = 0;

        while offset < data.len() {
            Self::check_can_send(&tcb, "send")?;
            let buf = tcb.send_buf.as_mut().ok_or(RxpError::NotConnected)?;

            match buf.put(&data[offset..]) {
                Ok(n) => {
                    offset += n;
                    tcb.stats.bytes_sent += n as u64;
                    self.shared.flush(&mut tcb, false);
                }
                Err(BufferError::Full) => {
                    let has_room = self.shared.wait_until(&mut tcb, deadline, |tcb| {
                        !tcb.state.can_send() || tcb.send_buf.as_ref().map_or(true, |b| b.available_space() > 0)
                    });
                    if !has_room {
                        return Err(RxpError::TimedOut);
                    }
                }
            }
        }

        Ok(())
    }

    /// Read up to `max` bytes, blocking until data arrives
    ///
    /// An empty result means the peer has closed its side and everything it
    /// sent has been read.
    pub fn recv(&self, max: usize) -> Result<Bytes> {
        let mss = self.shared.config().mss;
        let mut tcb = self.lock();
        let deadline = tcb.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            match tcb.state {
                ConnectionState::Open
                | ConnectionState::Listen
                | ConnectionState::YoRcvd
                | ConnectionState::YoSent
                | ConnectionState::SynYoAckSent => return Err(RxpError::NotConnected),
                _ => {}
            }
            if max == 0 {
                return Ok(Bytes::new());
            }

            if let Some(buf) = tcb.recv_buf.as_mut() {
                if !buf.is_empty() {
                    let was_low = buf.window_size() < mss;
                    let data = buf.take(max);
                    let reopened = was_low && buf.window_size() >= mss;

                    if reopened && tcb.state != ConnectionState::Closed {
                        tcb.ack_due = true;
                        self.shared.flush(&mut tcb, false);
                    }
                    return Ok(data);
                }
            }

            if tcb.peer_fin {
                return Ok(Bytes::new());
            }
            if tcb.state == ConnectionState::Closed {
                return Err(RxpError::Closed);
            }

            let ready = self.shared.wait_until(&mut tcb, deadline, |tcb| {
                tcb.peer_fin
                    || tcb.state == ConnectionState::Closed
                    || tcb.recv_buf.as_ref().map_or(false, |buf| !buf.is_empty())
            });
            if !ready {
                return Err(RxpError::TimedOut);
            }
        }
    }

    /// Close the connection
    ///
    /// An established connection sends its CYA after any queued data and
    /// blocks until both sides have closed; a listener stops accepting and
    /// aborts connections not yet accepted.
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        let mut tcb = self.lock();

        let next = match tcb.state {
            ConnectionState::Closed => return Err(RxpError::Closed),
            ConnectionState::Open
            | ConnectionState::Listen
            | ConnectionState::YoRcvd
            | ConnectionState::YoSent
            | ConnectionState::SynYoAckSent => {
                shared.finish(&mut tcb);
                shared.changed.notify_all();
                return Ok(());
            }
            ConnectionState::Established => ConnectionState::CyaSent,
            ConnectionState::CloseWait => ConnectionState::LastWord,
            state => return Err(RxpError::InvalidState { op: "close", state }),
        };

        let buf = tcb.send_buf.as_mut().ok_or(RxpError::NotConnected)?;
        let cya_seq = buf.put_control(Flags::CYA)?;
        tracing::debug!("Connection {} {} -> {}", shared.id, tcb.state, next);
        tcb.cya_seq = Some(cya_seq);
        tcb.state = next;
        shared.flush(&mut tcb, false);

        let peer = tcb.peer;
        let deadline = Instant::now() + shared.config().close_timeout;
        let done = shared.wait_until(&mut tcb, Some(deadline), |tcb| {
            matches!(tcb.state, ConnectionState::LastWait | ConnectionState::Closed)
        });

        let failed = !done || tcb.failed;
        if failed {
            tracing::warn!("Connection {} close timed out in {}", shared.id, tcb.state);
            shared.fail(&mut tcb);
            shared.changed.notify_all();
            return match peer {
                Some(peer) => Err(RxpError::ConnectionFailed(peer)),
                None => Err(RxpError::Closed),
            };
        }
        Ok(())
    }

    /// Bound blocking `accept`, `recv` and `send_all` calls; `None` waits
    /// forever
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.lock().timeout = timeout;
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer
    }

    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats()
    }

    /// Demultiplexer this socket sends through
    pub fn demux(&self) -> &Arc<Demultiplexer> {
        &self.shared.demux
    }
}

impl std::fmt::Debug for RxpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tcb = self.lock();
        f.debug_struct("RxpSocket")
            .field("id", &self.shared.id)
            .field("state", &tcb.state)
            .field("local", &tcb.local)
            .field("peer", &tcb.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RxpConfig;
    use rxp_io::{LossPolicy, SimNetwork};

    fn host(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 15000))
    }

    fn rxp_addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], port))
    }

    fn fast_config() -> RxpConfig {
        RxpConfig {
            initial_rto: Duration::from_millis(50),
            min_rto: Duration::from_millis(20),
            max_rto: Duration::from_millis(400),
            connect_timeout: Duration::from_millis(600),
            close_timeout: Duration::from_secs(3),
            last_wait: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn demux(net: &SimNetwork, last: u8) -> Arc<Demultiplexer> {
        let demux = Demultiplexer::new(fast_config(), Arc::new(net.endpoint(host(last)))).unwrap();
        demux.open().unwrap();
        demux
    }

    fn connected_pair(net: &SimNetwork) -> (Arc<Demultiplexer>, Arc<Demultiplexer>, RxpSocket, RxpSocket) {
        let server_demux = demux(net, 1);
        let client_demux = demux(net, 2);

        let listener = RxpSocket::new(&server_demux);
        listener.bind(rxp_addr(1, 80)).unwrap();
        listener.listen(1).unwrap();

        let client = RxpSocket::new(&client_demux);
        client.connect(rxp_addr(1, 80)).unwrap();

        listener.set_timeout(Some(Duration::from_secs(2)));
        let (server, _) = listener.accept().unwrap();
        (server_demux, client_demux, client, server)
    }

    #[test]
    fn test_bind_twice() {
        let net = SimNetwork::new(LossPolicy::Lossless);
        let d = demux(&net, 1);

        let socket = RxpSocket::new(&d);
        socket.bind(rxp_addr(1, 80)).unwrap();
        assert_eq!(socket.local_addr(), Some(rxp_addr(1, 80)));
        assert!(matches!(socket.bind(rxp_addr(1, 81)), Err(RxpError::AlreadyBound)));

        let other = RxpSocket::new(&d);
        assert!(matches!(other.bind(rxp_addr(1, 80)), Err(RxpError::PortUnavailable(80))));
    }

    #[test]
    fn test_bind_random_port() {
        let net = SimNetwork::new(LossPolicy::Lossless);
        let d = demux(&net, 1);

        let socket = RxpSocket::new(&d);
        socket.bind("0.0.0.0:0".parse().unwrap()).unwrap();
        let local = socket.local_addr().unwrap();
        assert_eq!(local.ip(), host(1).ip());
        assert_ne!(local.port(), 0);
        assert!(d.is_port_registered(local.port()));
    }

    #[test]
    fn test_operations_before_connect() {
        let net = SimNetwork::new(LossPolicy::Lossless);
        let d = demux(&net, 1);
        let socket = RxpSocket::new(&d);

        assert_eq!(socket.state(), ConnectionState::Open);
        assert!(matches!(socket.send(b"x"), Err(RxpError::NotConnected)));
        assert!(matches!(socket.recv(10), Err(RxpError::NotConnected)));
        assert!(matches!(socket.accept(), Err(RxpError::InvalidState { .. })));

        socket.listen(0).unwrap();
        assert_eq!(socket.state(), ConnectionState::Listen);
        assert!(matches!(
            socket.connect(rxp_addr(2, 80)),
            Err(RxpError::InvalidState { op: "connect", .. })
        ));

        socket.set_timeout(Some(Duration::from_millis(50)));
        assert!(matches!(socket.accept(), Err(RxpError::TimedOut)));

        socket.close().unwrap();
        assert_eq!(socket.state(), ConnectionState::Closed);
        assert!(matches!(socket.close(), Err(RxpError::Closed)));
        assert_eq!(d.route_count(), 0);
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let net = SimNetwork::new(LossPolicy::Lossless);
        let d = demux(&net, 1);
        let _silent = demux(&net, 2);

        let socket = RxpSocket::new(&d);
        let result = socket.connect(rxp_addr(2, 80));
        assert!(matches!(result, Err(RxpError::ConnectionFailed(addr)) if addr == rxp_addr(2, 80)));
        assert_eq!(socket.state(), ConnectionState::Closed);
        assert_eq!(d.route_count(), 0);
    }

    #[test]
    fn test_handshake_and_echo() {
        let net = SimNetwork::new(LossPolicy::Lossless);
        let (_sd, _cd, client, server) = connected_pair(&net);

        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(server.peer_addr(), client.local_addr());
        assert_eq!(client.peer_addr(), Some(rxp_addr(1, 80)));
        assert_eq!(server.local_addr(), Some(rxp_addr(1, 80)));

        client.set_timeout(Some(Duration::from_secs(2)));
        server.set_timeout(Some(Duration::from_secs(2)));

        assert_eq!(client.send(b"ping").unwrap(), 4);
        assert_eq!(&server.recv(16).unwrap()[..], b"ping");

        server.send_all(b"pong").unwrap();
        assert_eq!(&client.recv(16).unwrap()[..], b"pong");

        let stats = client.stats();
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
        assert!(stats.segments_sent >= 2);
    }

    #[test]
    fn test_recv_times_out() {
        let net = SimNetwork::new(LossPolicy::Lossless);
        let (_sd, _cd, client, _server) = connected_pair(&net);

        client.set_timeout(Some(Duration::from_millis(50)));
        assert!(matches!(client.recv(16), Err(RxpError::TimedOut)));
        assert!(client.recv(0).unwrap().is_empty());
    }

    #[test]
    fn test_orderly_close() {
        let net = SimNetwork::new(LossPolicy::Lossless);
        let (sd, cd, client, server) = connected_pair(&net);
        server.set_timeout(Some(Duration::from_secs(2)));

        client.send_all(b"last words").unwrap();
        let closer = client.clone();
        let active = std::thread::spawn(move || closer.close());

        let mut received = Vec::new();
        loop {
            let data = server.recv(64).unwrap();
            if data.is_empty() {
                break;
            }
            received.extend_from_slice(&data);
        }
        assert_eq!(received, b"last words");
        assert!(matches!(server.send(b"x"), Ok(1)));

        server.close().unwrap();
        assert_eq!(server.state(), ConnectionState::Closed);
        active.join().unwrap().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while client.state() != ConnectionState::Closed && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.send(b"x"), Err(RxpError::Closed)));

        // The listener was dropped by connected_pair
        assert_eq!(cd.route_count(), 0);
        assert_eq!(sd.route_count(), 0);
    }

    #[test]
    fn test_send_buffer_backpressure() {
        let net = SimNetwork::new(LossPolicy::Lossless);
        let config = RxpConfig {
            send_buffer_segments: 2,
            ..fast_config()
        };
        let server_demux = Demultiplexer::new(config.clone(), Arc::new(net.endpoint(host(1)))).unwrap();
        let client_demux = Demultiplexer::new(config, Arc::new(net.endpoint(host(2)))).unwrap();
        server_demux.open().unwrap();
        client_demux.open().unwrap();

        let listener = RxpSocket::new(&server_demux);
        listener.bind(rxp_addr(1, 80)).unwrap();
        listener.listen(1).unwrap();
        let client = RxpSocket::new(&client_demux);
        client.connect(rxp_addr(1, 80)).unwrap();

        // Stop acknowledgments so nothing leaves the send buffer
        net.set_policy(LossPolicy::DropEveryNth(1));
        let mss = client_demux.config().mss;
        let data = vec![7u8; 5 * mss];
        assert_eq!(client.send(&data).unwrap(), 2 * mss);
        assert!(matches!(client.send(&data), Err(RxpError::WouldBlock)));
    }
}
