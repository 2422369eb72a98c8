//! RxP Server - accepts connections and stores or echoes their streams

use clap::Parser;
use rxp::{RxpSocket, DEFAULT_RELAY_ADDR};
use rxp_cli::{display_compact_stats, display_connection_stats, init_logging, Config, ServerConfig};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "rxp-server")]
#[command(about = "RxP server: receive (or echo) streams over RxP", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RxP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Local UDP port
    #[arg(short, long)]
    udp_port: Option<u16>,

    /// Relay to send through (use --relay without a value for the default)
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_RELAY_ADDR)]
    relay: Option<SocketAddr>,

    /// Output ('-' for stdout, otherwise a directory for one file per
    /// connection)
    #[arg(short, long)]
    output: Option<String>,

    /// Echo received data back to the client
    #[arg(short, long)]
    echo: bool,

    /// Statistics interval in seconds
    #[arg(long)]
    stats: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let mut network = config.network;
    if let Some(udp_port) = args.udp_port {
        network.udp_port = udp_port;
    }
    if args.relay.is_some() {
        network.first_hop = args.relay;
    }

    let mut server = match (config.server, args.port) {
        (Some(server), _) => server,
        (None, Some(port)) => ServerConfig {
            port,
            output: "-".to_string(),
            echo: false,
            stats_interval_secs: 0,
        },
        (None, None) => anyhow::bail!("A listen port is required (use --port or a [server] table)"),
    };
    if let Some(port) = args.port {
        server.port = port;
    }
    if let Some(output) = args.output {
        server.output = output;
    }
    if let Some(stats) = args.stats {
        server.stats_interval_secs = stats;
    }
    server.echo |= args.echo;

    if server.output != "-" {
        fs::create_dir_all(&server.output)?;
    }

    let demux = rxp::setup_with_config(network.to_rxp_config()?)?;
    let listener = RxpSocket::new(&demux);
    listener.bind(SocketAddr::from(([0, 0, 0, 0], server.port)))?;
    listener.listen(0)?;

    tracing::info!("RxP server listening on port {} (UDP {})", server.port, network.udp_port);
    if let Some(relay) = network.first_hop {
        tracing::info!("Sending through relay {}", relay);
    }

    loop {
        let (conn, peer) = listener.accept()?;
        tracing::info!("Accepted connection from {}", peer);

        let server = server.clone();
        thread::Builder::new()
            .name(format!("rxp-conn-{}", peer))
            .spawn(move || {
                if let Err(e) = serve(&conn, peer, &server) {
                    tracing::warn!("Connection from {} ended with error: {}", peer, e);
                }
            })?;
    }
}

fn open_output(output: &str, peer: SocketAddr) -> anyhow::Result<Box<dyn Write>> {
    if output == "-" {
        return Ok(Box::new(io::stdout()));
    }

    let name = format!("rxp-{}-{}.bin", peer.ip(), peer.port());
    let path = Path::new(output).join(name);
    tracing::info!("Writing stream from {} to {}", peer, path.display());
    let file = File::create(&path).map_err(|e| anyhow::anyhow!("Failed to create '{}': {}", path.display(), e))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn serve(conn: &RxpSocket, peer: SocketAddr, server: &ServerConfig) -> anyhow::Result<()> {
    let mut writer = if server.echo {
        None
    } else {
        Some(open_output(&server.output, peer)?)
    };

    let start = Instant::now();
    let mut last_stats = Instant::now();
    let mss = conn.demux().config().mss;

    loop {
        let data = conn.recv(16 * mss)?;
        if data.is_empty() {
            break;
        }

        match writer.as_mut() {
            Some(writer) => writer.write_all(&data)?,
            None => conn.send_all(&data)?,
        }

        if let Some(interval) = server.stats_interval() {
            if last_stats.elapsed() >= interval {
                display_compact_stats(&conn.stats(), start.elapsed());
                last_stats = Instant::now();
            }
        }
    }

    if let Some(writer) = writer.as_mut() {
        writer.flush()?;
    }

    tracing::info!("Stream from {} finished", peer);
    conn.close()?;

    if server.stats_interval().is_some() {
        display_connection_stats(&peer.to_string(), &conn.stats());
    }
    Ok(())
}
