//! Connection demultiplexer
//!
//! One demultiplexer owns the datagram transport shared by every RxP
//! connection on a host. A background thread decodes inbound datagrams and
//! routes each segment to its connection, first by `(local port, peer)` and
//! then by local port alone. Outbound segments go to the configured first
//! hop, or straight to the peer's host.

use crate::config::RxpConfig;
use crate::error::{Result, RxpError};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rxp_io::transport::MAX_DATAGRAM_SIZE;
use rxp_io::{DatagramTransport, SocketError, TimerHandle, TimerService};
use rxp_protocol::{codec, Segment};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receiver of routed segments
///
/// Called on the demultiplexer's receive thread with no registry lock held.
pub trait SegmentHandler: Send + Sync {
    fn handle_segment(&self, peer: SocketAddr, segment: Segment);
}

/// Identity of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
struct Route {
    id: ConnectionId,
    handler: Weak<dyn SegmentHandler>,
}

#[derive(Default)]
struct Routes {
    ports: HashMap<u16, Route>,
    peers: HashMap<(u16, SocketAddr), Route>,
}

impl Routes {
    fn lookup(&self, port: u16, peer: SocketAddr) -> Option<Route> {
        self.peers
            .get(&(port, peer))
            .or_else(|| self.ports.get(&port))
            .cloned()
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.ports.contains_key(&port) || self.peers.keys().any(|(p, _)| *p == port)
    }
}

enum Lifecycle {
    Idle,
    Running(JoinHandle<()>),
    Closed,
}

/// Routes segments between one datagram transport and many connections
pub struct Demultiplexer {
    config: RxpConfig,
    transport: RwLock<Option<Arc<dyn DatagramTransport>>>,
    local_ip: IpAddr,
    routes: Arc<RwLock<Routes>>,
    running: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    timers: TimerService,
    next_id: AtomicU64,
}

impl Demultiplexer {
    /// Create a demultiplexer over `transport`; call [`Demultiplexer::open`]
    /// to start receiving
    pub fn new(config: RxpConfig, transport: Arc<dyn DatagramTransport>) -> Result<Arc<Self>> {
        config.validate()?;
        let local_ip = transport.local_addr()?.ip();
        let timers = TimerService::start()?;

        Ok(Arc::new(Demultiplexer {
            config,
            transport: RwLock::new(Some(transport)),
            local_ip,
            routes: Arc::new(RwLock::new(Routes::default())),
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle::Idle),
            timers,
            next_id: AtomicU64::new(1),
        }))
    }

    /// Start the receive thread
    pub fn open(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(RxpError::AlreadyOpen);
        }

        let transport = self.transport.read().clone().ok_or(RxpError::NotOpen)?;
        let routes = Arc::clone(&self.routes);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("rxp-demux".into())
            .spawn(move || receive_loop(transport, routes, running))?;

        tracing::info!("Demultiplexer open on {}", self.local_ip);
        *lifecycle = Lifecycle::Running(handle);
        Ok(())
    }

    /// Stop the receive thread and release the transport
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let handle = match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Running(handle) => handle,
            other => {
                *lifecycle = other;
                return Err(RxpError::NotOpen);
            }
        };
        drop(lifecycle);

        self.running.store(false, Ordering::Release);
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
        self.transport.write().take();

        tracing::info!("Demultiplexer closed");
        Ok(())
    }

    /// True between a successful `open` and `close`
    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &RxpConfig {
        &self.config
    }

    /// IP address connections on this demultiplexer report as local
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Allocate an identity for a new connection
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Route all traffic for a local port to `handler`
    ///
    /// Picks a random free port when `port` is `None`.
    pub fn register(&self, id: ConnectionId, handler: Weak<dyn SegmentHandler>, port: Option<u16>) -> Result<u16> {
        let mut routes = self.routes.write();

        let port = match port {
            Some(port) => {
                if port == 0 || routes.port_in_use(port) {
                    return Err(RxpError::PortUnavailable(port));
                }
                port
            }
            None => pick_free_port(&routes)?,
        };

        routes.ports.insert(port, Route { id, handler });
        tracing::debug!("Connection {} registered on port {}", id, port);
        Ok(port)
    }

    /// Route one peer's traffic on a local port to `handler`
    pub fn register_peer(&self, id: ConnectionId, handler: Weak<dyn SegmentHandler>, port: u16, peer: SocketAddr) {
        self.routes.write().peers.insert((port, peer), Route { id, handler });
        tracing::debug!("Connection {} registered for {} on port {}", id, peer, port);
    }

    /// Remove every route belonging to `id`; a no-op if none remain
    pub fn deregister(&self, id: ConnectionId) {
        let mut routes = self.routes.write();
        routes.ports.retain(|_, route| route.id != id);
        routes.peers.retain(|_, route| route.id != id);
    }

    /// True if traffic from `peer` to `port` has a dedicated route
    pub fn has_route(&self, port: u16, peer: SocketAddr) -> bool {
        self.routes.read().peers.contains_key(&(port, peer))
    }

    /// True if a connection owns `port`
    pub fn is_port_registered(&self, port: u16) -> bool {
        self.routes.read().ports.contains_key(&port)
    }

    /// Number of routes of any kind
    pub fn route_count(&self) -> usize {
        let routes = self.routes.read();
        routes.ports.len() + routes.peers.len()
    }

    /// Encode and transmit a segment addressed to `dest`
    pub fn send(&self, dest: SocketAddr, segment: &Segment) -> Result<()> {
        let bytes = codec::encode(segment)?;
        let target = self
            .config
            .first_hop
            .unwrap_or_else(|| SocketAddr::new(dest.ip(), self.config.peer_udp_port));

        let transport = self.transport.read().clone().ok_or(RxpError::NotOpen)?;
        transport.send_datagram(target, &bytes)?;

        tracing::trace!("-> {} via {}: {}", dest, target, segment);
        Ok(())
    }

    /// Run `callback` after `delay` unless the returned handle is dropped
    /// first
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.timers.schedule(delay, callback)
    }
}

impl Drop for Demultiplexer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn pick_free_port(routes: &Routes) -> Result<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let port = rng.gen_range(1..=u16::MAX);
        if !routes.port_in_use(port) {
            return Ok(port);
        }
    }

    (1..=u16::MAX)
        .find(|port| !routes.port_in_use(*port))
        .ok_or(RxpError::NoFreePort)
}

fn receive_loop(transport: Arc<dyn DatagramTransport>, routes: Arc<RwLock<Routes>>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while running.load(Ordering::Acquire) {
        match transport.receive_datagram(&mut buf) {
            Ok(Some((n, from))) => dispatch(&routes, from, &buf[..n]),
            Ok(None) => {}
            Err(SocketError::Closed) => break,
            Err(e) => {
                tracing::warn!("Receive error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    tracing::debug!("Receive loop stopped");
}

fn dispatch(routes: &RwLock<Routes>, from: SocketAddr, bytes: &[u8]) {
    let segment = match codec::decode(bytes) {
        Ok(segment) => segment,
        Err(e) => {
            tracing::debug!("Dropping datagram from {}: {}", from, e);
            return;
        }
    };

    let peer = SocketAddr::new(from.ip(), segment.src_port());
    let route = routes.read().lookup(segment.dst_port(), peer);

    match route.and_then(|route| route.handler.upgrade()) {
        Some(handler) => {
            tracing::trace!("<- {}: {}", peer, segment);
            handler.handle_segment(peer, segment);
        }
        None => tracing::debug!("No route for {} from {}", segment, peer),
    }
}
