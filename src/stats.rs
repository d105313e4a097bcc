//! In-memory traffic statistics: global totals, per-protocol counts, and
//! per-application rollups.
//!
//! Scalar counters are atomics; the protocol histograms and the application
//! table are sharded maps, so the per-interface capture tasks update them
//! without a global lock. Entries are handed out as `Arc` handles shared
//! between the capture tasks and the flusher.

use crate::db::{AppStatsRow, Store};
use crate::process::{short_name, ProcessInfo};
use dashmap::{DashMap, DashSet};
use log::{debug, error, info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Upper bound on distinct destinations remembered per application. Inserts
/// beyond the cap are dropped (never evicted) and flagged once in the log.
pub const MAX_DESTINATIONS: usize = 4096;

/// Statistics for one application, shared between capture tasks and the
/// flusher.
pub struct AppStats {
    pub process_id: u32,
    pub process_name: String,
    pub process_path: String,
    pub total_packets: AtomicU64,
    pub total_bytes: AtomicU64,
    pub packets_by_protocol: DashMap<String, u64>,
    pub destinations: DashSet<String>,
    last_saved: Mutex<Instant>,
    destinations_capped: AtomicBool,
}

impl AppStats {
    fn new(process_id: u32, process_name: &str, process_path: &str) -> Self {
        AppStats {
            process_id,
            process_name: process_name.to_string(),
            process_path: process_path.to_string(),
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            packets_by_protocol: DashMap::new(),
            destinations: DashSet::new(),
            last_saved: Mutex::new(Instant::now()),
            destinations_capped: AtomicBool::new(false),
        }
    }

    fn insert_destination(&self, destination: &str) {
        if self.destinations.len() >= MAX_DESTINATIONS && !self.destinations.contains(destination)
        {
            if !self.destinations_capped.swap(true, Ordering::Relaxed) {
                warn!(
                    "destination set for {} reached {} entries; further destinations are not recorded",
                    self.process_name, MAX_DESTINATIONS
                );
            }
            return;
        }
        self.destinations.insert(destination.to_string());
    }

    fn destinations_json(&self) -> String {
        let mut destinations: Vec<String> =
            self.destinations.iter().map(|d| d.key().clone()).collect();
        destinations.sort();
        serde_json::to_string(&destinations).unwrap_or_else(|_| "[]".to_string())
    }
}

/// A unit of work for the flusher task.
pub enum FlushRequest {
    /// Flush a single application entry whose save interval elapsed.
    Entry(Arc<AppStats>),
    /// Flush everything (packet-count threshold or shutdown).
    All,
}

/// Global and per-application statistics for the running capture session.
pub struct Statistics {
    pub start_time: Instant,
    pub total_packets: AtomicU64,
    pub total_bytes: AtomicU64,
    pub packets_by_protocol: DashMap<String, u64>,
    apps: DashMap<String, Arc<AppStats>>,
    save_interval: Duration,
    last_saved: Mutex<Instant>,
    flush_tx: mpsc::UnboundedSender<FlushRequest>,
}

impl Statistics {
    /// Creates the statistics table and the channel the flusher drains.
    pub fn new(save_interval: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<FlushRequest>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Statistics {
            start_time: Instant::now(),
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            packets_by_protocol: DashMap::new(),
            apps: DashMap::new(),
            save_interval,
            last_saved: Mutex::new(Instant::now()),
            flush_tx,
        });
        (stats, flush_rx)
    }

    /// Records one packet in the global counters and returns the running
    /// packet count.
    pub fn record_packet(&self, protocol: &str, bytes: u64) -> u64 {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        *self
            .packets_by_protocol
            .entry(protocol.to_string())
            .or_insert(0) += 1;
        self.total_packets.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Updates the rollup for the application owning a packet.
    ///
    /// Creates the entry on first sight and schedules an asynchronous flush
    /// once the entry's save interval has elapsed.
    pub fn update_app(&self, info: &ProcessInfo, protocol: &str, bytes: u64, destination: &str) {
        if info.path.is_empty() {
            return;
        }

        let key = short_name(&info.path).to_string();
        let app = self
            .apps
            .entry(key)
            .or_insert_with(|| Arc::new(AppStats::new(info.pid, &info.name, &info.path)))
            .clone();

        app.total_packets.fetch_add(1, Ordering::Relaxed);
        app.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        *app.packets_by_protocol
            .entry(protocol.to_string())
            .or_insert(0) += 1;

        if !destination.is_empty() {
            app.insert_destination(destination);
        }

        let mut last_saved = app.last_saved.lock().unwrap();
        if last_saved.elapsed() > self.save_interval {
            *last_saved = Instant::now();
            drop(last_saved);
            let _ = self.flush_tx.send(FlushRequest::Entry(app));
        }
    }

    /// Schedules a flush of every application entry.
    pub fn request_save_all(&self) {
        let _ = self.flush_tx.send(FlushRequest::All);
    }

    pub fn has_apps(&self) -> bool {
        !self.apps.is_empty()
    }

    /// Snapshot of the per-application entry handles.
    pub fn apps(&self) -> Vec<(String, Arc<AppStats>)> {
        self.apps
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Flushes every application entry to the store.
    ///
    /// Entries with no recorded packets are skipped. A panic or error while
    /// saving one entry is logged and does not stop the iteration.
    pub fn save_all(&self, store: &Store) {
        let entries = self.apps();
        if entries.is_empty() {
            return;
        }
        debug!("saving statistics for {} applications", entries.len());

        let mut saved = 0usize;
        let mut failed = 0usize;
        for (name, app) in entries {
            if app.total_packets.load(Ordering::Relaxed) == 0 {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| self.save_app(store, &app))) {
                Ok(Ok(())) => saved += 1,
                Ok(Err(e)) => {
                    failed += 1;
                    error!("failed to save statistics for {}: {}", name, e);
                }
                Err(_) => {
                    failed += 1;
                    error!("panic while saving statistics for {}", name);
                }
            }
        }

        *self.last_saved.lock().unwrap() = Instant::now();
        info!(
            "statistics saved to database: {} successful, {} failed",
            saved, failed
        );
    }

    /// Flushes a single application entry: the rollup row plus one protocol
    /// counter row per protocol.
    pub fn save_app(&self, store: &Store, app: &AppStats) -> anyhow::Result<()> {
        if app.total_packets.load(Ordering::Relaxed) == 0 {
            return Ok(());
        }
        if !store.is_initialized() {
            anyhow::bail!("store not initialized");
        }

        store.upsert_app_stats(&AppStatsRow {
            process_id: app.process_id,
            process_name: app.process_name.clone(),
            process_path: app.process_path.clone(),
            total_packets: app.total_packets.load(Ordering::Relaxed),
            total_bytes: app.total_bytes.load(Ordering::Relaxed),
            destinations_json: app.destinations_json(),
        })?;

        for entry in app.packets_by_protocol.iter() {
            store.upsert_protocol_stats(
                &app.process_name,
                app.process_id,
                entry.key(),
                *entry.value(),
            )?;
        }

        *app.last_saved.lock().unwrap() = Instant::now();
        Ok(())
    }

    /// Rebuilds the in-memory application table from persisted rows so that
    /// counters resume from their last flushed values.
    pub fn load_from_store(&self, store: &Store) {
        let stored = match store.get_all_app_stats() {
            Ok(stored) => stored,
            Err(e) => {
                error!("failed to load application statistics: {}", e);
                return;
            }
        };

        let mut loaded = 0usize;
        for row in stored {
            let app = AppStats::new(row.process_id, &row.process_name, &row.process_path);
            app.total_packets.store(row.total_packets, Ordering::Relaxed);
            app.total_bytes.store(row.total_bytes, Ordering::Relaxed);

            match store.get_protocol_stats_for_app(row.id) {
                Ok(protocols) => {
                    for (protocol, count) in protocols {
                        app.packets_by_protocol.insert(protocol, count);
                    }
                }
                Err(e) => error!(
                    "failed to load protocol statistics for {}: {}",
                    row.process_name, e
                ),
            }

            if !row.destinations.is_empty() {
                match serde_json::from_str::<Vec<String>>(&row.destinations) {
                    Ok(destinations) => {
                        for destination in destinations {
                            app.destinations.insert(destination);
                        }
                    }
                    Err(e) => error!(
                        "failed to parse destinations for {}: {}",
                        row.process_name, e
                    ),
                }
            }

            let key = if row.process_path.is_empty() {
                row.process_name.clone()
            } else {
                short_name(&row.process_path).to_string()
            };
            self.apps.insert(key, Arc::new(app));
            loaded += 1;
        }

        if loaded > 0 {
            info!("loaded statistics for {} applications from database", loaded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curl() -> ProcessInfo {
        ProcessInfo {
            pid: 42,
            name: "curl".into(),
            path: "/usr/bin/curl".into(),
        }
    }

    fn stats() -> (Arc<Statistics>, mpsc::UnboundedReceiver<FlushRequest>) {
        Statistics::new(Duration::from_secs(30))
    }

    #[test]
    fn protocol_counts_sum_to_total() {
        let (stats, _rx) = stats();
        for _ in 0..7 {
            stats.record_packet("TCP", 100);
        }
        for _ in 0..3 {
            stats.record_packet("UDP", 50);
        }

        let total = stats.total_packets.load(Ordering::Relaxed);
        let by_protocol: u64 = stats.packets_by_protocol.iter().map(|e| *e.value()).sum();
        assert_eq!(total, 10);
        assert_eq!(by_protocol, total);
        assert_eq!(stats.total_bytes.load(Ordering::Relaxed), 850);
    }

    #[test]
    fn counters_are_monotonic() {
        let (stats, _rx) = stats();
        let mut last = 0;
        for _ in 0..100 {
            let n = stats.record_packet("TCP", 1);
            assert!(n > last);
            last = n;
        }
    }

    #[test]
    fn update_app_accumulates_and_dedupes_destinations() {
        let (stats, _rx) = stats();
        for _ in 0..5 {
            stats.update_app(&curl(), "TCP", 100, "8.8.8.8");
        }
        stats.update_app(&curl(), "UDP", 10, "");

        let apps = stats.apps();
        assert_eq!(apps.len(), 1);
        let (key, app) = &apps[0];
        assert_eq!(key, "curl");
        assert_eq!(app.total_packets.load(Ordering::Relaxed), 6);
        assert_eq!(app.total_bytes.load(Ordering::Relaxed), 510);
        assert_eq!(app.destinations.len(), 1);
        assert_eq!(*app.packets_by_protocol.get("TCP").unwrap(), 5);
        assert_eq!(*app.packets_by_protocol.get("UDP").unwrap(), 1);
    }

    #[test]
    fn unknown_application_is_skipped() {
        let (stats, _rx) = stats();
        stats.update_app(
            &ProcessInfo {
                pid: 1,
                name: "mystery".into(),
                path: String::new(),
            },
            "TCP",
            10,
            "8.8.8.8",
        );
        assert!(!stats.has_apps());
    }

    #[test]
    fn elapsed_save_interval_schedules_entry_flush() {
        let (stats, mut rx) = Statistics::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        stats.update_app(&curl(), "TCP", 100, "8.8.8.8");

        match rx.try_recv() {
            Ok(FlushRequest::Entry(app)) => assert_eq!(app.process_name, "curl"),
            _ => panic!("expected an entry flush request"),
        }
    }

    #[test]
    fn request_save_all_enqueues_work() {
        let (stats, mut rx) = stats();
        stats.request_save_all();
        assert!(matches!(rx.try_recv(), Ok(FlushRequest::All)));
    }

    #[test]
    fn save_all_matches_store_contents() {
        let (stats, _rx) = stats();
        let store = Store::open(":memory:").unwrap();

        for _ in 0..250 {
            stats.update_app(&curl(), "TCP", 100, "8.8.8.8");
        }
        for _ in 0..50 {
            stats.update_app(&curl(), "UDP", 10, "8.8.4.4");
        }
        stats.save_all(&store);

        let apps = store.get_all_app_stats().unwrap();
        assert_eq!(apps.len(), 1);
        let row = &apps[0];
        assert_eq!(row.process_name, "curl");
        assert_eq!(row.process_id, 42);
        assert_eq!(row.total_packets, 300);
        assert_eq!(row.total_bytes, 25_500);

        let destinations: Vec<String> = serde_json::from_str(&row.destinations).unwrap();
        assert_eq!(destinations, vec!["8.8.4.4", "8.8.8.8"]);

        let protocols = store.get_protocol_stats_for_app(row.id).unwrap();
        let total: u64 = protocols.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 300);
    }

    #[test]
    fn load_from_store_resumes_counters() {
        let store = Store::open(":memory:").unwrap();
        {
            let (stats, _rx) = stats();
            for _ in 0..12 {
                stats.update_app(&curl(), "TCP", 64, "8.8.8.8");
            }
            stats.save_all(&store);
        }

        let (fresh, _rx) = stats();
        fresh.load_from_store(&store);

        let apps = fresh.apps();
        assert_eq!(apps.len(), 1);
        let (key, app) = &apps[0];
        assert_eq!(key, "curl");
        assert_eq!(app.total_packets.load(Ordering::Relaxed), 12);
        assert_eq!(app.total_bytes.load(Ordering::Relaxed), 768);
        assert_eq!(*app.packets_by_protocol.get("TCP").unwrap(), 12);
        assert!(app.destinations.contains("8.8.8.8"));
    }
}
