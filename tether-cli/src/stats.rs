//! Statistics display and formatting

use std::sync::Arc;
use std::time::Duration;
use tether::Connection;
use tether_protocol::ConnectionStats;

/// Byte count with a binary unit suffix
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Uptime as `[Nd ]HH:MM:SS`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, rest) = (total / 86_400, total % 86_400);
    let clock = format!("{:02}:{:02}:{:02}", rest / 3600, rest % 3600 / 60, rest % 60);

    if days > 0 {
        format!("{}d {}", days, clock)
    } else {
        clock
    }
}

/// Share of sent packets that were retransmissions, in percent
pub fn resend_ratio(stats: &ConnectionStats) -> f64 {
    if stats.packets_sent == 0 {
        0.0
    } else {
        stats.resends as f64 * 100.0 / stats.packets_sent as f64
    }
}

/// One-line summary of a connection's counters
pub fn format_compact_stats(stats: &ConnectionStats) -> String {
    format!(
        "sent {} pkts / {} | recv {} pkts / {} | resends {} ({:.1}%) | dup {} | failed {} | bad {}",
        stats.packets_sent,
        format_bytes(stats.bytes_sent),
        stats.packets_received,
        format_bytes(stats.bytes_received),
        stats.resends,
        resend_ratio(stats),
        stats.duplicates_dropped,
        stats.items_failed,
        stats.malformed_dropped
    )
}

/// Print a table of every connection
pub fn display_connection_stats(connections: &[Arc<Connection>], uptime: Duration) {
    println!("\n┌─────────────────────────────────────────────────────────────────────────────┐");
    println!(
        "│ CONNECTIONS: {:<4} UPTIME: {:<48}│",
        connections.len(),
        format_duration(uptime)
    );
    println!("├──────┬───────────────────────┬───────────────┬──────────┬──────────┬────────┤");
    println!("│ Id   │ Peer                  │ State         │ Sent     │ Received │ Resend │");
    println!("├──────┼───────────────────────┼───────────────┼──────────┼──────────┼────────┤");

    for conn in connections {
        let stats = conn.stats();
        println!(
            "│ {:4} │ {:21} │ {:13} │ {:8} │ {:8} │ {:6} │",
            conn.id().as_raw(),
            conn.address_string(),
            format!("{:?}", conn.state()),
            format_bytes(stats.bytes_sent),
            format_bytes(stats.bytes_received),
            stats.resends
        );
    }

    println!("└──────┴───────────────────────┴───────────────┴──────────┴──────────┴────────┘");
}
