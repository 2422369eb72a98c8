//! Simulated datagram network
//!
//! An in-memory hub connecting any number of [`SimTransport`] endpoints.
//! Every datagram passing through the hub is counted and may be dropped
//! according to the configured [`LossPolicy`].

use crate::socket::SocketError;
use crate::transport::{DatagramTransport, DEFAULT_POLL_INTERVAL};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Drop decision for one datagram, given its source, destination and bytes
pub type DropFilter = Arc<dyn Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync>;

/// Which datagrams the network discards
#[derive(Clone)]
pub enum LossPolicy {
    Lossless,
    /// Drop datagrams number n, 2n, 3n, ... (counted across the network)
    DropEveryNth(u64),
    /// Drop each datagram independently with probability `rate`
    Random { rate: f64, seed: u64 },
    /// Drop exactly the datagrams the filter selects
    ///
    /// The filter runs with the network locked and must not send.
    Filter(DropFilter),
}

impl LossPolicy {
    /// Policy dropping the datagrams for which `filter` returns true
    pub fn filter<F>(filter: F) -> Self
    where
        F: Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync + 'static,
    {
        LossPolicy::Filter(Arc::new(filter))
    }
}

impl fmt::Debug for LossPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossPolicy::Lossless => write!(f, "Lossless"),
            LossPolicy::DropEveryNth(n) => write!(f, "DropEveryNth({})", n),
            LossPolicy::Random { rate, seed } => write!(f, "Random {{ rate: {}, seed: {} }}", rate, seed),
            LossPolicy::Filter(_) => write!(f, "Filter(..)"),
        }
    }
}

type Datagram = (Vec<u8>, SocketAddr);

struct Hub {
    endpoints: HashMap<SocketAddr, (u64, Sender<Datagram>)>,
    next_endpoint: u64,
    policy: LossPolicy,
    rng: StdRng,
    delivered: u64,
    dropped: u64,
    seen: u64,
}

impl Hub {
    fn should_drop(&mut self, from: SocketAddr, to: SocketAddr, data: &[u8]) -> bool {
        self.seen += 1;
        match &self.policy {
            LossPolicy::Lossless => false,
            LossPolicy::DropEveryNth(n) => *n > 0 && self.seen % *n == 0,
            LossPolicy::Random { rate, .. } => self.rng.gen_bool(rate.clamp(0.0, 1.0)),
            LossPolicy::Filter(filter) => filter(from, to, data),
        }
    }
}

/// Shared in-memory network
#[derive(Clone)]
pub struct SimNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl SimNetwork {
    /// Create a network with the given loss behavior
    pub fn new(policy: LossPolicy) -> Self {
        let seed = match &policy {
            LossPolicy::Random { seed, .. } => *seed,
            _ => 0,
        };

        SimNetwork {
            hub: Arc::new(Mutex::new(Hub {
                endpoints: HashMap::new(),
                next_endpoint: 0,
                policy,
                rng: StdRng::seed_from_u64(seed),
                delivered: 0,
                dropped: 0,
                seen: 0,
            })),
        }
    }

    /// Attach an endpoint listening on `addr`
    ///
    /// Replaces any endpoint previously attached at the same address.
    pub fn endpoint(&self, addr: SocketAddr) -> SimTransport {
        self.endpoint_with_poll_interval(addr, DEFAULT_POLL_INTERVAL)
    }

    pub fn endpoint_with_poll_interval(&self, addr: SocketAddr, poll_interval: Duration) -> SimTransport {
        let (tx, rx) = channel::unbounded();
        let mut hub = self.hub.lock();
        hub.next_endpoint += 1;
        let id = hub.next_endpoint;
        hub.endpoints.insert(addr, (id, tx));
        drop(hub);

        SimTransport {
            id,
            addr,
            rx,
            hub: Arc::clone(&self.hub),
            poll_interval,
        }
    }

    /// Change the loss behavior for subsequent datagrams
    pub fn set_policy(&self, policy: LossPolicy) {
        let mut hub = self.hub.lock();
        hub.policy = policy;
        hub.seen = 0;
    }

    /// Number of datagrams handed to an endpoint
    pub fn delivered(&self) -> u64 {
        self.hub.lock().delivered
    }

    /// Number of datagrams discarded by the loss policy
    pub fn dropped(&self) -> u64 {
        self.hub.lock().dropped
    }
}

/// One endpoint of a [`SimNetwork`]
pub struct SimTransport {
    id: u64,
    addr: SocketAddr,
    rx: Receiver<Datagram>,
    hub: Arc<Mutex<Hub>>,
    poll_interval: Duration,
}

impl DatagramTransport for SimTransport {
    fn send_datagram(&self, dest: SocketAddr, data: &[u8]) -> Result<usize, SocketError> {
        let mut hub = self.hub.lock();

        if hub.should_drop(self.addr, dest, data) {
            hub.dropped += 1;
            tracing::trace!("sim: dropped {} bytes {} -> {}", data.len(), self.addr, dest);
            return Ok(data.len());
        }

        // Unknown destinations swallow the datagram, as UDP would
        if let Some((_, tx)) = hub.endpoints.get(&dest) {
            if tx.send((data.to_vec(), self.addr)).is_ok() {
                hub.delivered += 1;
            }
        }

        Ok(data.len())
    }

    fn receive_datagram(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.rx.recv_timeout(self.poll_interval) {
            Ok((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some((n, from)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SocketError::Closed),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.addr)
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        let mut hub = self.hub.lock();
        // Only detach if a newer endpoint has not taken over the address
        if hub.endpoints.get(&self.addr).map_or(false, |(id, _)| *id == self.id) {
            hub.endpoints.remove(&self.addr);
        }
    }
}
