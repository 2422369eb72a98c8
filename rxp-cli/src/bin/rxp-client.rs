//! RxP Client - streams a file or stdin to an RxP server

use clap::Parser;
use rxp::{RxpSocket, DEFAULT_RELAY_ADDR};
use rxp_cli::{display_compact_stats, display_connection_stats, format_bytes, init_logging, ClientConfig, Config};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rxp-client")]
#[command(about = "RxP client: send a stream to an RxP server", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server RxP address (host:port)
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// Local UDP port
    #[arg(short, long)]
    udp_port: Option<u16>,

    /// Relay to send through (use --relay without a value for the default)
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_RELAY_ADDR)]
    relay: Option<SocketAddr>,

    /// Input file ('-' for stdin)
    #[arg(short, long)]
    input: Option<String>,

    /// Print the server's echo to stdout
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

    let mut client = match (config.client, args.server) {
        (Some(client), _) => client,
        (None, Some(server)) => ClientConfig {
            server,
            input: "-".to_string(),
            expect_echo: false,
            stats_interval_secs: 0,
        },
        (None, None) => anyhow::bail!("A server address is required (use --server or a [client] table)"),
    };
    if let Some(server) = args.server {
        client.server = server;
    }
    if let Some(input) = args.input {
        client.input = input;
    }
    if let Some(stats) = args.stats {
        client.stats_interval_secs = stats;
    }
    client.expect_echo |= args.echo;

    let mut input: Box<dyn Read> = if client.input == "-" {
        tracing::info!("Reading from stdin");
        Box::new(io::stdin())
    } else {
        tracing::info!("Reading from file: {}", client.input);
        let file = File::open(&client.input)
            .map_err(|e| anyhow::anyhow!("Failed to open '{}': {}", client.input, e))?;
        Box::new(file)
    };

    let demux = rxp::setup_with_config(network.to_rxp_config()?)?;
    let socket = RxpSocket::new(&demux);

    tracing::info!("Connecting to {}", client.server);
    socket.connect(client.server)?;
    tracing::info!("Connected from {:?}", socket.local_addr());

    let echo_reader = if client.expect_echo {
        let reader = socket.clone();
        Some(thread::spawn(move || -> anyhow::Result<u64> {
            let mut stdout = io::stdout();
            let mut total = 0u64;
            loop {
                let data = reader.recv(64 * 1024)?;
                if data.is_empty() {
                    break;
                }
                total += data.len() as u64;
                stdout.write_all(&data)?;
            }
            stdout.flush()?;
            Ok(total)
        }))
    } else {
        None
    };

    let start = Instant::now();
    let mut last_stats = Instant::now();
    let mut buffer = vec![0u8; 8192];
    let mut total_sent = 0u64;

    loop {
        let n = input.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        socket.send_all(&buffer[..n])?;
        total_sent += n as u64;

        if let Some(interval) = client.stats_interval() {
            if last_stats.elapsed() >= interval {
                display_compact_stats(&socket.stats(), start.elapsed());
                last_stats = Instant::now();
            }
        }
    }

    tracing::info!("Sent {} in {:?}, closing", format_bytes(total_sent), start.elapsed());
    socket.close()?;

    if let Some(reader) = echo_reader {
        match reader.join() {
            Ok(result) => {
                let echoed = result?;
                if echoed != total_sent {
                    tracing::warn!("Echo returned {} of {} bytes", echoed, total_sent);
                }
            }
            Err(_) => anyhow::bail!("Echo reader panicked"),
        }
    }

    if client.stats_interval().is_some() {
        display_connection_stats(&client.server.to_string(), &socket.stats());
    }

    // Let the final ACK go out before the transport closes
    thread::sleep(Duration::from_millis(50));
    demux.close()?;
    Ok(())
}
