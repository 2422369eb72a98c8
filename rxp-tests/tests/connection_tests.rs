//! End-to-end connection tests
//!
//! Full handshakes, transfers and teardowns between demultiplexers attached
//! to an in-memory network, with and without datagram loss.

use rxp::{ConnectionState, Demultiplexer, RxpConfig, RxpError, RxpSocket};
use rxp_io::{LossPolicy, SimNetwork};
use rxp_protocol::{codec, Segment};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn host(last: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], 15000))
}

fn rxp_addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], port))
}

fn test_config() -> RxpConfig {
    RxpConfig {
        initial_rto: Duration::from_millis(60),
        min_rto: Duration::from_millis(20),
        max_rto: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(10),
        last_wait: Duration::from_secs(1),
        ..Default::default()
    }
}

fn demux(net: &SimNetwork, last: u8) -> Arc<Demultiplexer> {
    demux_with(net, last, test_config())
}

fn demux_with(net: &SimNetwork, last: u8, config: RxpConfig) -> Arc<Demultiplexer> {
    let demux = Demultiplexer::new(config, Arc::new(net.endpoint(host(last)))).unwrap();
    demux.open().unwrap();
    demux
}

fn listen(demux: &Arc<Demultiplexer>, port: u16) -> RxpSocket {
    listen_with_backlog(demux, port, 4)
}

fn listen_with_backlog(demux: &Arc<Demultiplexer>, port: u16, backlog: usize) -> RxpSocket {
    let listener = RxpSocket::new(demux);
    listener.bind(SocketAddr::new(demux.local_ip(), port)).unwrap();
    listener.listen(backlog).unwrap();
    listener.set_timeout(Some(Duration::from_secs(5)));
    listener
}

/// Timeouts long enough that no retransmission fires during a test
fn patient_config() -> RxpConfig {
    RxpConfig {
        initial_rto: Duration::from_secs(3),
        min_rto: Duration::from_secs(1),
        max_rto: Duration::from_secs(4),
        ..test_config()
    }
}

/// Counts segments picked by a [`drop_first`] policy
#[derive(Default)]
struct Matches {
    seen: AtomicUsize,
    dropped: AtomicUsize,
}

impl Matches {
    fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }

    fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Loss policy dropping the first `count` segments for which `select`
/// holds, given the sending host
fn drop_first<F>(count: usize, select: F) -> (LossPolicy, Arc<Matches>)
where
    F: Fn(SocketAddr, &Segment) -> bool + Send + Sync + 'static,
{
    let matches = Arc::new(Matches::default());
    let counter = Arc::clone(&matches);
    let policy = LossPolicy::filter(move |from, _, data| {
        let Ok(segment) = codec::decode(data) else { return false };
        if !select(from, &segment) {
            return false;
        }
        if counter.seen.fetch_add(1, Ordering::SeqCst) < count {
            counter.dropped.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        false
    });
    (policy, matches)
}

fn is_bare_ack(segment: &Segment) -> bool {
    segment.is_ack() && !segment.is_yo() && !segment.is_cya() && segment.payload.is_empty()
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

fn read_to_end(socket: &RxpSocket) -> Vec<u8> {
    let mut received = Vec::new();
    loop {
        let data = socket.recv(4096).unwrap();
        if data.is_empty() {
            return received;
        }
        received.extend_from_slice(&data);
    }
}

#[test]
fn test_handshake() {
    let net = SimNetwork::new(LossPolicy::Lossless);
    let server_demux = demux(&net, 1);
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    assert_eq!(client.state(), ConnectionState::Established);

    let (server, peer) = listener.accept().unwrap();
    assert_eq!(Some(peer), client.local_addr());
    assert_eq!(server.peer_addr(), client.local_addr());
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(listener.state(), ConnectionState::Listen);

    // Listener port plus one peer route on each side
    assert!(server_demux.has_route(80, peer));
    assert_eq!(server_demux.route_count(), 2);
}

#[test]
fn test_accept_many_clients() {
    let net = SimNetwork::new(LossPolicy::Lossless);
    let server_demux = demux(&net, 1);
    let listener = listen(&server_demux, 80);

    let clients: Vec<_> = (2..5)
        .map(|last| {
            let socket = RxpSocket::new(&demux(&net, last));
            socket.connect(rxp_addr(1, 80)).unwrap();
            socket
        })
        .collect();

    let mut conns = Vec::new();
    for _ in 0..clients.len() {
        let (conn, peer) = listener.accept().unwrap();
        assert!(clients.iter().any(|c| c.local_addr() == Some(peer)));

        let message = peer.to_string();
        conn.send_all(message.as_bytes()).unwrap();
        conns.push(conn);
    }

    for client in &clients {
        client.set_timeout(Some(Duration::from_secs(5)));
        let expected = client.local_addr().unwrap().to_string();
        let mut received = Vec::new();
        while received.len() < expected.len() {
            received.extend_from_slice(&client.recv(64).unwrap());
        }
        assert_eq!(received, expected.as_bytes());
    }
}

#[test]
fn test_teardown_removes_routes() {
    let net = SimNetwork::new(LossPolicy::Lossless);
    let server_demux = demux(&net, 1);
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    let (server, _) = listener.accept().unwrap();
    listener.close().unwrap();

    let closer = client.clone();
    let active = thread::spawn(move || closer.close());

    // Passive side reads to end of stream, then closes
    server.set_timeout(Some(Duration::from_secs(5)));
    assert!(read_to_end(&server).is_empty());
    assert_eq!(server.state(), ConnectionState::CloseWait);
    server.close().unwrap();

    active.join().unwrap().unwrap();
    assert_eq!(server.state(), ConnectionState::Closed);

    wait_for("client to leave LAST_WAIT", || client.state() == ConnectionState::Closed);
    assert_eq!(client_demux.route_count(), 0);
    assert_eq!(server_demux.route_count(), 0);
}

#[test]
fn test_simultaneous_close() {
    let net = SimNetwork::new(LossPolicy::Lossless);
    let server_demux = demux(&net, 1);
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    let (server, _) = listener.accept().unwrap();

    let closers: Vec<_> = [client.clone(), server.clone()]
        .into_iter()
        .map(|socket| thread::spawn(move || socket.close()))
        .collect();
    for closer in closers {
        closer.join().unwrap().unwrap();
    }

    wait_for("both sides to close", || {
        client.state() == ConnectionState::Closed && server.state() == ConnectionState::Closed
    });
    assert_eq!(client_demux.route_count(), 0);
}

#[test]
fn test_hello_world_over_lossy_channel() {
    let net = SimNetwork::new(LossPolicy::DropEveryNth(3));
    let server_demux = demux(&net, 1);
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    let (server, _) = listener.accept().unwrap();

    client.send_all(b"hello world").unwrap();

    server.set_timeout(Some(Duration::from_secs(10)));
    let mut received = Vec::new();
    while received.len() < 11 {
        received.extend_from_slice(&server.recv(64).unwrap());
    }
    assert_eq!(received, b"hello world");

    // Nothing further arrives: no duplicates
    server.set_timeout(Some(Duration::from_millis(300)));
    assert!(matches!(server.recv(64), Err(RxpError::TimedOut)));
    assert!(net.dropped() > 0);
}

#[test]
fn test_bulk_transfer_with_random_loss() {
    let net = SimNetwork::new(LossPolicy::Random { rate: 0.05, seed: 42 });
    let server_demux = demux(&net, 1);
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    let (server, _) = listener.accept().unwrap();

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let sender = {
        let client = client.clone();
        let data = data.clone();
        thread::spawn(move || -> Result<(), RxpError> {
            client.set_timeout(Some(Duration::from_secs(30)));
            client.send_all(&data)?;
            client.close()
        })
    };

    server.set_timeout(Some(Duration::from_secs(30)));
    let received = read_to_end(&server);
    assert_eq!(received.len(), data.len());
    assert!(received == data, "stream corrupted or reordered");
    server.close().unwrap();
    sender.join().unwrap().unwrap();

    let stats = client.stats();
    assert_eq!(stats.bytes_sent, data.len() as u64);
    assert!(stats.retransmissions > 0);
    assert_eq!(server.stats().bytes_received, data.len() as u64);
}

#[test]
fn test_congestion_window_grows() {
    // Long timeouts so a slow machine cannot fake a loss
    let config = RxpConfig {
        initial_rto: Duration::from_secs(2),
        min_rto: Duration::from_secs(1),
        max_rto: Duration::from_secs(4),
        ..test_config()
    };
    let net = SimNetwork::new(LossPolicy::Lossless);
    let server_demux = demux_with(&net, 1, config.clone());
    let client_demux = demux_with(&net, 2, config);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    let (server, _) = listener.accept().unwrap();

    // The acknowledged YO is the first new ack
    let mss = client_demux.config().mss;
    assert_eq!(client.stats().congestion_window, 1 + mss);

    client.send_all(&vec![1u8; 8 * mss]).unwrap();

    server.set_timeout(Some(Duration::from_secs(5)));
    let mut total = 0;
    while total < 8 * mss {
        total += server.recv(64 * 1024).unwrap().len();
    }

    wait_for("all data to be acknowledged", || client.stats().congestion_window == 1 + 9 * mss);
    assert!(client.stats().srtt.is_some());
}

#[test]
fn test_dropped_unaccepted_connections_on_listener_close() {
    let net = SimNetwork::new(LossPolicy::Lossless);
    let server_demux = demux(&net, 1);
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    wait_for("child route", || server_demux.route_count() == 2);

    listener.close().unwrap();
    assert_eq!(server_demux.route_count(), 0);
    assert!(matches!(listener.accept(), Err(RxpError::Closed)));
}

#[test]
fn test_window_not_multiple_of_mss_is_never_overrun() {
    let config = RxpConfig {
        initial_rto: Duration::from_secs(1),
        min_rto: Duration::from_millis(500),
        max_rto: Duration::from_secs(4),
        ..test_config()
    };
    let net = SimNetwork::new(LossPolicy::Lossless);
    let server_demux = demux_with(
        &net,
        1,
        RxpConfig {
            recv_buffer_size: 1536,
            ..config.clone()
        },
    );
    let client_demux = demux_with(&net, 2, config);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    let (server, _) = listener.accept().unwrap();

    let data: Vec<u8> = (0..16 * 1024u32).map(|i| (i % 253) as u8).collect();
    let sender = {
        let client = client.clone();
        let data = data.clone();
        thread::spawn(move || -> Result<(), RxpError> {
            client.set_timeout(Some(Duration::from_secs(20)));
            client.send_all(&data)?;
            client.close()
        })
    };

    server.set_timeout(Some(Duration::from_secs(20)));
    let mut received = Vec::new();
    loop {
        let chunk = server.recv(4096).unwrap();
        if chunk.is_empty() {
            break;
        }
        received.extend_from_slice(&chunk);
    }
    server.close().unwrap();
    sender.join().unwrap().unwrap();

    assert!(received == data, "stream corrupted or reordered");
    assert_eq!(server.stats().dropped_segments, 0);
    assert_eq!(client.stats().retransmissions, 0);
}

#[test]
fn test_lost_handshake_ack_is_recovered() {
    // The accepted child's ACK is the first bare ACK the server host sends
    let (policy, matches) = drop_first(1, |from, segment| from == host(1) && is_bare_ack(segment));
    let net = SimNetwork::new(policy);
    let server_demux = demux(&net, 1);
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    let (server, _) = listener.accept().unwrap();
    assert_eq!(matches.dropped(), 1);
    assert_eq!(client.state(), ConnectionState::Established);

    // The resent YO+ACK reached the child as a duplicate
    assert!(client.stats().retransmissions >= 1);
    assert!(server.stats().dropped_segments >= 1);

    client.send_all(b"ping").unwrap();
    server.set_timeout(Some(Duration::from_secs(5)));
    assert_eq!(&server.recv(64).unwrap()[..], b"ping");
}

#[test]
fn test_duplicate_yo_resends_listener_yo() {
    // The listener's own timer would take seconds; the client's resent YO
    // has to bring the answer
    let (policy, matches) = drop_first(1, |from, segment| from == host(1) && segment.is_yo());
    let net = SimNetwork::new(policy);
    let server_demux = demux_with(&net, 1, patient_config());
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    let start = Instant::now();
    client.connect(rxp_addr(1, 80)).unwrap();

    assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    assert_eq!(matches.dropped(), 1);
    assert!(matches.seen() >= 2);
    listener.accept().unwrap();
}

#[test]
fn test_duplicate_yo_resends_yo_ack() {
    // The client's own timer would take seconds; the listener's resent YO
    // has to bring the YO+ACK again
    let (policy, matches) = drop_first(1, |from, segment| from == host(2) && segment.is_yo() && segment.is_ack());
    let net = SimNetwork::new(policy);
    let server_demux = demux(&net, 1);
    let client_demux = demux_with(&net, 2, patient_config());
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    let start = Instant::now();
    client.connect(rxp_addr(1, 80)).unwrap();

    assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    assert_eq!(matches.dropped(), 1);
    assert!(matches.seen() >= 2);
    listener.accept().unwrap();
}

#[test]
fn test_full_accept_queue_ignores_new_handshakes() {
    let net = SimNetwork::new(LossPolicy::Lossless);
    let server_demux = demux(&net, 1);
    let listener = listen_with_backlog(&server_demux, 80, 1);

    let first = RxpSocket::new(&demux(&net, 2));
    first.connect(rxp_addr(1, 80)).unwrap();

    let impatient = RxpConfig {
        connect_timeout: Duration::from_millis(500),
        ..test_config()
    };
    let refused = RxpSocket::new(&demux_with(&net, 3, impatient));
    assert!(matches!(refused.connect(rxp_addr(1, 80)), Err(RxpError::ConnectionFailed(_))));
    assert_eq!(refused.state(), ConnectionState::Closed);

    // Listener plus the queued child only
    assert_eq!(server_demux.route_count(), 2);
    assert_eq!(listener.state(), ConnectionState::Listen);

    let (_conn, peer) = listener.accept().unwrap();
    assert_eq!(Some(peer), first.local_addr());

    let later = RxpSocket::new(&demux(&net, 4));
    later.connect(rxp_addr(1, 80)).unwrap();
    let (_conn, peer) = listener.accept().unwrap();
    assert_eq!(Some(peer), later.local_addr());
}

#[test]
fn test_last_wait_acknowledges_retransmitted_cya() {
    // Drop the active closer's final ACK: the first bare ACK it sends after
    // the passive side's CYA went out
    let peer_closed = Arc::new(AtomicBool::new(false));
    let (policy, matches) = drop_first(1, {
        let peer_closed = Arc::clone(&peer_closed);
        move |from, segment| {
            if from == host(1) && segment.is_cya() {
                peer_closed.store(true, Ordering::SeqCst);
            }
            from == host(2) && is_bare_ack(segment) && peer_closed.load(Ordering::SeqCst)
        }
    });
    let net = SimNetwork::new(policy);

    // The passive side resends its CYA after about 600 ms; LAST_WAIT lasts 1 s
    let server_demux = demux_with(
        &net,
        1,
        RxpConfig {
            initial_rto: Duration::from_millis(600),
            min_rto: Duration::from_millis(600),
            max_rto: Duration::from_secs(2),
            ..test_config()
        },
    );
    let client_demux = demux(&net, 2);
    let listener = listen(&server_demux, 80);

    let client = RxpSocket::new(&client_demux);
    client.connect(rxp_addr(1, 80)).unwrap();
    let (server, _) = listener.accept().unwrap();

    let closer = client.clone();
    let active = thread::spawn(move || closer.close());

    server.set_timeout(Some(Duration::from_secs(5)));
    assert!(read_to_end(&server).is_empty());
    let passive = {
        let server = server.clone();
        thread::spawn(move || server.close())
    };

    wait_for("client to reach LAST_WAIT", || client.state() == ConnectionState::LastWait);
    let entered = Instant::now();
    active.join().unwrap().unwrap();

    // Past the original release time, the re-acknowledgment restarted it
    thread::sleep(Duration::from_millis(1200).saturating_sub(entered.elapsed()));
    assert_eq!(client.state(), ConnectionState::LastWait);

    passive.join().unwrap().unwrap();
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(matches.dropped(), 1);

    wait_for("client to leave LAST_WAIT", || client.state() == ConnectionState::Closed);
    assert_eq!(client_demux.route_count(), 0);
}
