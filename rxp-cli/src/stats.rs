//! Statistics display and formatting

use rxp::ConnectionStats;
use std::io::Write;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format a round-trip time in human-readable form
pub fn format_rtt(rtt: Duration) -> String {
    let rtt_us = rtt.as_micros();
    if rtt_us >= 1_000_000 {
        format!("{:.2}s", rtt_us as f64 / 1_000_000.0)
    } else if rtt_us >= 1_000 {
        format!("{:.2}ms", rtt_us as f64 / 1_000.0)
    } else {
        format!("{}µs", rtt_us)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Display connection statistics as a table
pub fn display_connection_stats(label: &str, stats: &ConnectionStats) {
    let state = stats.state.map_or_else(|| "-".to_string(), |state| state.to_string());
    let srtt = stats.srtt.map_or_else(|| "N/A".to_string(), format_rtt);

    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ CONNECTION {:<48} │", label);
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ State:     {:<48} │", state);
    println!(
        "│ Segments:  {:<48} │",
        format!("{} sent / {} received", stats.segments_sent, stats.segments_received)
    );
    println!(
        "│ Bytes:     {:<48} │",
        format!("{} sent / {} received", format_bytes(stats.bytes_sent), format_bytes(stats.bytes_received))
    );
    println!(
        "│ Lost:      {:<48} │",
        format!("{} retransmitted / {} dropped", stats.retransmissions, stats.dropped_segments)
    );
    println!(
        "│ Timing:    {:<48} │",
        format!("srtt {} / rto {}", srtt, format_rtt(stats.rto))
    );
    println!(
        "│ Window:    {:<48} │",
        format_bytes(stats.congestion_window as u64)
    );
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// Display compact stats on one line (for continuous updates)
pub fn display_compact_stats(stats: &ConnectionStats, elapsed: Duration) {
    let secs = elapsed.as_secs();
    let throughput_bps = if secs > 0 {
        (stats.bytes_sent.max(stats.bytes_received) * 8) / secs
    } else {
        0
    };

    eprint!(
        "\r[{:8}] Sent: {} | Received: {} | Rate: {} | Retx: {} | cwnd: {}         ",
        format_duration(elapsed),
        format_bytes(stats.bytes_sent),
        format_bytes(stats.bytes_received),
        format_bandwidth(throughput_bps),
        stats.retransmissions,
        format_bytes(stats.congestion_window as u64)
    );

    let _ = std::io::stderr().flush();
}
