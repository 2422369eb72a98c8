//! RxP Relay - lossy UDP forwarder between two RxP hosts
//!
//! Every datagram from one endpoint is forwarded to the other, after the
//! configured loss and corruption have been applied. Point both hosts'
//! first hop at the relay to exercise retransmission over a bad link.

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rxp::DEFAULT_RELAY_ADDR;
use rxp_cli::{format_bytes, init_logging, Config, RelayConfig};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rxp-relay")]
#[command(about = "UDP relay with loss emulation for RxP", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// The two UDP endpoints to forward between
    #[arg(short, long, num_args = 2)]
    endpoints: Vec<SocketAddr>,

    /// Probability of dropping each datagram (0.0 to 1.0)
    #[arg(long)]
    loss: Option<f64>,

    /// Drop every Nth datagram
    #[arg(long)]
    drop_every: Option<u64>,

    /// Probability of corrupting each datagram (0.0 to 1.0)
    #[arg(long)]
    corrupt: Option<f64>,

    /// Seed for reproducible loss
    #[arg(long)]
    seed: Option<u64>,

    /// Statistics interval in seconds
    #[arg(long, default_value = "5")]
    stats: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Default)]
struct RelayStats {
    forwarded: u64,
    dropped: u64,
    corrupted: u64,
    unknown: u64,
    bytes: u64,
}

/// Decides the fate of each datagram
struct Impairment {
    rng: StdRng,
    loss_rate: f64,
    drop_every: u64,
    corrupt_rate: f64,
    seen: u64,
}

impl Impairment {
    fn new(config: &RelayConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Impairment {
            rng,
            loss_rate: config.loss_rate.clamp(0.0, 1.0),
            drop_every: config.drop_every,
            corrupt_rate: config.corrupt_rate.clamp(0.0, 1.0),
            seen: 0,
        }
    }

    fn should_drop(&mut self) -> bool {
        self.seen += 1;
        if self.drop_every > 0 && self.seen % self.drop_every == 0 {
            return true;
        }
        self.rng.gen_bool(self.loss_rate)
    }

    /// Flip one byte; returns true if the datagram was altered
    fn maybe_corrupt(&mut self, data: &mut [u8]) -> bool {
        if data.is_empty() || !self.rng.gen_bool(self.corrupt_rate) {
            return false;
        }
        let i = self.rng.gen_range(0..data.len());
        data[i] ^= self.rng.gen_range(1..=u8::MAX);
        true
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let mut relay = match config.relay {
        Some(relay) => relay,
        None => {
            if args.endpoints.len() != 2 {
                anyhow::bail!("Two endpoints are required (use --endpoints A B or a [relay] table)");
            }
            RelayConfig {
                listen: DEFAULT_RELAY_ADDR.parse()?,
                endpoints: [args.endpoints[0], args.endpoints[1]],
                loss_rate: 0.0,
                drop_every: 0,
                corrupt_rate: 0.0,
                seed: None,
            }
        }
    };
    if let Some(listen) = args.listen {
        relay.listen = listen;
    }
    if let [a, b] = args.endpoints.as_slice() {
        relay.endpoints = [*a, *b];
    }
    if let Some(loss) = args.loss {
        relay.loss_rate = loss;
    }
    if let Some(drop_every) = args.drop_every {
        relay.drop_every = drop_every;
    }
    if let Some(corrupt) = args.corrupt {
        relay.corrupt_rate = corrupt;
    }
    if args.seed.is_some() {
        relay.seed = args.seed;
    }

    run(&relay, Duration::from_secs(args.stats))
}

fn run(config: &RelayConfig, stats_interval: Duration) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(config.listen)?;
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;

    let [a, b] = config.endpoints;
    tracing::info!("Relaying {} <-> {} on {}", a, b, socket.local_addr()?);
    tracing::info!(
        "Loss {:.1}%, drop every {}, corruption {:.1}%",
        config.loss_rate * 100.0,
        config.drop_every,
        config.corrupt_rate * 100.0
    );

    let mut impairment = Impairment::new(config);
    let mut stats = RelayStats::default();
    let mut buffer = vec![0u8; 65536];
    let mut last_stats = Instant::now();

    loop {
        if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
            tracing::info!(
                "Forwarded {} ({}), dropped {}, corrupted {}, unknown {}",
                stats.forwarded,
                format_bytes(stats.bytes),
                stats.dropped,
                stats.corrupted,
                stats.unknown
            );
            last_stats = Instant::now();
        }

        let (n, from) = match socket.recv_from(&mut buffer) {
            Ok(result) => result,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                tracing::error!("Receive error: {}", e);
                return Err(e.into());
            }
        };

        let to = if from == a {
            b
        } else if from == b {
            a
        } else {
            stats.unknown += 1;
            tracing::debug!("Ignoring datagram from unknown sender {}", from);
            continue;
        };

        if impairment.should_drop() {
            stats.dropped += 1;
            tracing::trace!("Dropped {} bytes {} -> {}", n, from, to);
            continue;
        }
        if impairment.maybe_corrupt(&mut buffer[..n]) {
            stats.corrupted += 1;
        }

        match socket.send_to(&buffer[..n], to) {
            Ok(_) => {
                stats.forwarded += 1;
                stats.bytes += n as u64;
            }
            Err(e) => tracing::warn!("Forward to {} failed: {}", to, e),
        }
    }
}
