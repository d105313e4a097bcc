//! Periodic statistics summaries emitted through the logger.

use crate::stats::Statistics;
use log::info;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const MAX_DESTINATIONS_SHOWN: usize = 10;

/// Logs a summary of the session every `interval` until the task is
/// aborted.
pub async fn run_reporter(stats: Arc<Statistics>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate first tick

    loop {
        ticker.tick().await;
        log_statistics(&stats);
    }
}

/// Writes uptime, totals, protocol distribution, and per-application
/// breakdowns to the log.
pub fn log_statistics(stats: &Statistics) {
    let uptime = stats.start_time.elapsed();
    let uptime_secs = uptime.as_secs().max(1);
    let total_packets = stats.total_packets.load(Ordering::Relaxed);
    let total_bytes = stats.total_bytes.load(Ordering::Relaxed);

    info!("=== Network Statistics ===");
    info!("Uptime: {}s", uptime.as_secs());
    info!("Total Packets: {}", total_packets);
    info!("Total Bytes: {}", total_bytes);
    info!(
        "Packets/Second: {:.2}",
        total_packets as f64 / uptime_secs as f64
    );
    info!(
        "Bytes/Second: {:.2}",
        total_bytes as f64 / uptime_secs as f64
    );

    if total_packets > 0 {
        info!("Protocol Distribution:");
        for entry in stats.packets_by_protocol.iter() {
            let count = *entry.value();
            info!(
                "  {}: {} ({:.1}%)",
                entry.key(),
                count,
                count as f64 / total_packets as f64 * 100.0
            );
        }
    }

    let apps = stats.apps();
    if !apps.is_empty() {
        info!("=== Application Statistics ===");
        for (name, app) in apps {
            let app_packets = app.total_packets.load(Ordering::Relaxed);
            info!("Application: {} (PID: {})", name, app.process_id);
            info!("  Total Packets: {}", app_packets);
            info!("  Total Bytes: {}", app.total_bytes.load(Ordering::Relaxed));

            if app_packets > 0 {
                info!("  Protocol Distribution:");
                for entry in app.packets_by_protocol.iter() {
                    let count = *entry.value();
                    info!(
                        "    {}: {} ({:.1}%)",
                        entry.key(),
                        count,
                        count as f64 / app_packets as f64 * 100.0
                    );
                }
            }

            let destination_count = app.destinations.len();
            if destination_count > 0 {
                info!("  Connected to {} destinations:", destination_count);
                for destination in app.destinations.iter().take(MAX_DESTINATIONS_SHOWN) {
                    info!("    {}", destination.key());
                }
                if destination_count > MAX_DESTINATIONS_SHOWN {
                    info!(
                        "    ... and {} more",
                        destination_count - MAX_DESTINATIONS_SHOWN
                    );
                }
            }
            info!("  ---------------------");
        }
    }

    info!("=====================");
}
