//! The capture-classification-attribution pipeline.
//!
//! One blocking task per interface consumes its packet source, classifies
//! and attributes each packet, updates the aggregator, and appends a row to
//! the store. A dedicated flusher task drains aggregate deltas on a fixed
//! interval and on demand.

use crate::config::Config;
use crate::db::{PacketRecord, Store};
use crate::direction::{classify, Direction, LocalAddressSource, SystemAddresses};
use crate::error::NetmonError;
use crate::interfaces::InterfaceRegistry;
use crate::privilege;
use crate::process::ProcessInfo;
use crate::resolver::{FlowResolver, SystemResolver};
use crate::source::{CapturedFrame, LiveSource, PacketSource};
use crate::stats::{FlushRequest, Statistics};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Every Nth packet schedules an additional save of all aggregates, on top
/// of the periodic flusher.
const SAVE_TRIGGER_PACKETS: u64 = 1000;

/// Everything one per-interface task needs to process packets.
struct PipelineContext {
    device_name: String,
    registry: Arc<InterfaceRegistry>,
    stats: Arc<Statistics>,
    store: Arc<Store>,
    resolver: Arc<dyn FlowResolver>,
    locals: Arc<dyn LocalAddressSource>,
}

/// Handle to a running capture session.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    flusher_shutdown: mpsc::Sender<()>,
    capture_tasks: Vec<JoinHandle<()>>,
    flusher: JoinHandle<()>,
    stats: Arc<Statistics>,
    store: Arc<Store>,
}

impl CaptureHandle {
    pub fn stats(&self) -> Arc<Statistics> {
        self.stats.clone()
    }
}

/// Initializes the store, registers interfaces, and starts one capture task
/// per interface plus the flusher.
///
/// Fatal errors here (store, capture runtime, no interfaces) abort startup;
/// a single interface that cannot be opened is skipped with a log line.
pub async fn start_capture(config: &Config) -> Result<CaptureHandle, NetmonError> {
    let store = Arc::new(Store::open(Store::default_path()?)?);

    check_capture_runtime()?;

    let registry = Arc::new(InterfaceRegistry::new());
    let interfaces = registry.enumerate_and_register(&store)?;
    info!("starting capture on {} network interfaces", interfaces.len());

    // Without elevation the pipeline still runs, but every packet record and
    // application rollup will carry empty process fields.
    match privilege::is_elevated() {
        Ok(true) => info!("running elevated; socket table lookups enabled"),
        Ok(false) => {
            warn!("NOT running elevated: packets will be recorded without process attribution")
        }
        Err(e) => warn!("could not determine elevation status: {}", e),
    }

    let (stats, flush_rx) = Statistics::new(config.save_interval());
    stats.load_from_store(&store);

    let stop = Arc::new(AtomicBool::new(false));
    let (flusher_shutdown, shutdown_rx) = mpsc::channel(1);
    let flusher = tokio::spawn(run_flusher(
        stats.clone(),
        store.clone(),
        flush_rx,
        shutdown_rx,
        config.save_interval(),
    ));

    let resolver: Arc<dyn FlowResolver> = Arc::new(SystemResolver);
    let locals: Arc<dyn LocalAddressSource> = Arc::new(SystemAddresses);

    let mut capture_tasks = Vec::new();
    for iface in interfaces {
        let ctx = PipelineContext {
            device_name: iface.name.clone(),
            registry: registry.clone(),
            stats: stats.clone(),
            store: store.clone(),
            resolver: resolver.clone(),
            locals: locals.clone(),
        };
        let stop = stop.clone();

        capture_tasks.push(tokio::task::spawn_blocking(move || {
            let mut source = match LiveSource::open(&ctx.device_name, stop) {
                Ok(source) => source,
                Err(e) => {
                    error!("{}", e);
                    return;
                }
            };
            info!("capturing on {} ({})", iface.name, iface.description);
            capture_loop(&mut source, &ctx);
            info!("capture on {} finished", ctx.device_name);
        }));
    }

    Ok(CaptureHandle {
        stop,
        flusher_shutdown,
        capture_tasks,
        flusher,
        stats,
        store,
    })
}

/// Closes the packet sources, drains the aggregator, and closes the store.
///
/// Capture reads block without a timeout, so a task may linger for up to one
/// packet after the stop flag is raised; such stragglers are abandoned after
/// a grace period.
pub async fn stop_capture(handle: CaptureHandle) {
    info!("stopping capture");
    handle.stop.store(true, Ordering::SeqCst);
    let _ = handle.flusher_shutdown.send(()).await;

    for task in handle.capture_tasks {
        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("capture task ended abnormally: {}", e),
            Err(_) => warn!("capture task still blocked on a read; abandoning it"),
        }
    }
    if let Err(e) = handle.flusher.await {
        warn!("flusher task error: {}", e);
    }

    let stats = handle.stats;
    let store = handle.store;
    let _ = tokio::task::spawn_blocking(move || {
        stats.save_all(&store);
        store.close();
    })
    .await;

    info!("capture stopped");
}

fn capture_loop(source: &mut dyn PacketSource, ctx: &PipelineContext) {
    while let Some(frame) = source.next_frame() {
        process_frame(ctx, frame);
    }
}

/// Runs one decoded frame through the full pipeline.
fn process_frame(ctx: &PipelineContext, frame: CapturedFrame) {
    let Some(net) = frame.network else {
        return;
    };

    let count = ctx.stats.record_packet(&net.protocol, net.length as u64);
    if count % SAVE_TRIGGER_PACKETS == 0 {
        debug!("processing packet #{}, scheduling statistics save", count);
        ctx.stats.request_save_all();
    }

    let src_port = net.src_port.parse::<u16>().unwrap_or(0);
    let dst_port = net.dst_port.parse::<u16>().unwrap_or(0);

    let direction = classify(&net.src_ip, &net.dst_ip, &ctx.locals.addresses());

    let process = lookup_flow(
        ctx.resolver.as_ref(),
        &net.protocol,
        src_port,
        dst_port,
        direction,
    );
    if let Some(info) = &process {
        ctx.stats
            .update_app(info, &net.protocol, net.length as u64, &net.dst_ip);
    }

    let Some(device_id) = ctx.registry.id_for(&ctx.device_name) else {
        error!("no device id registered for interface {}", ctx.device_name);
        return;
    };

    let record = PacketRecord {
        timestamp: Utc::now(),
        device_id,
        src_ip: net.src_ip,
        src_port: net.src_port,
        dst_ip: net.dst_ip,
        dst_port: net.dst_port,
        protocol: net.protocol,
        length: net.length as u32,
        process_id: process.as_ref().map(|p| p.pid),
        process_name: process.as_ref().map(|p| p.name.clone()),
        process_path: process.as_ref().map(|p| p.path.clone()),
        direction,
    };

    // Storage failures must not stall capture; log and move on.
    if let Err(e) = ctx.store.append_packet(&record) {
        error!("error storing packet: {}", e);
    }

    log_packet(&ctx.device_name, &record);
}

/// Attributes a flow to its owning process.
///
/// The side holding the local port depends on direction: `outgoing` means
/// the source port is local, `incoming` the destination port; `internal`
/// tries the source side first. Unknown protocols skip the lookup entirely,
/// and any failure leaves the packet unattributed.
fn lookup_flow(
    resolver: &dyn FlowResolver,
    protocol: &str,
    src_port: u16,
    dst_port: u16,
    direction: Direction,
) -> Option<ProcessInfo> {
    use Direction::{Incoming, Internal, Outgoing};

    match protocol {
        "TCP" => {
            if matches!(direction, Outgoing | Internal) {
                match resolver.find_tcp(src_port, dst_port) {
                    Ok(info) => return Some(info),
                    Err(e) => debug!("source-side TCP lookup failed: {}", e),
                }
            }
            if matches!(direction, Incoming | Internal) {
                match resolver.find_tcp(dst_port, src_port) {
                    Ok(info) => return Some(info),
                    Err(e) => debug!("destination-side TCP lookup failed: {}", e),
                }
            }
        }
        "UDP" => {
            if matches!(direction, Outgoing | Internal) {
                match resolver.find_udp(src_port) {
                    Ok(info) => return Some(info),
                    Err(e) => debug!("source-side UDP lookup failed: {}", e),
                }
            }
            if matches!(direction, Incoming | Internal) {
                match resolver.find_udp(dst_port) {
                    Ok(info) => return Some(info),
                    Err(e) => debug!("destination-side UDP lookup failed: {}", e),
                }
            }
        }
        _ => return None,
    }

    debug!(
        "no owning process found for {} traffic ({}) between ports {} and {}",
        protocol, direction, src_port, dst_port
    );
    None
}

fn log_packet(device: &str, record: &PacketRecord) {
    match (&record.process_name, record.process_id) {
        (Some(name), Some(pid)) => info!(
            "[{}] {}:{} -> {}:{}, Protocol: {}, Length: {} bytes, Direction: {}, Process: {} ({}) [{}]",
            device,
            record.src_ip,
            record.src_port,
            record.dst_ip,
            record.dst_port,
            record.protocol,
            record.length,
            record.direction,
            name,
            pid,
            record.process_path.as_deref().unwrap_or(""),
        ),
        _ => info!(
            "[{}] {}:{} -> {}:{}, Protocol: {}, Length: {} bytes, Direction: {}",
            device,
            record.src_ip,
            record.src_port,
            record.dst_ip,
            record.dst_port,
            record.protocol,
            record.length,
            record.direction,
        ),
    }
}

/// Drains aggregate deltas into the store: periodically, when an entry's
/// save interval elapses, and on the packet-count trigger. All store work
/// runs on the blocking pool.
async fn run_flusher(
    stats: Arc<Statistics>,
    store: Arc<Store>,
    mut flush_rx: mpsc::UnboundedReceiver<FlushRequest>,
    mut shutdown_rx: mpsc::Receiver<()>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if stats.has_apps() {
                    debug!("periodic save of statistics to database");
                    save_all_blocking(stats.clone(), store.clone()).await;
                }
            }
            request = flush_rx.recv() => {
                match request {
                    Some(FlushRequest::Entry(app)) => {
                        let stats = stats.clone();
                        let store = store.clone();
                        match tokio::task::spawn_blocking(move || stats.save_app(&store, &app)).await {
                            Ok(Err(e)) => error!("failed to save application statistics: {}", e),
                            Err(e) => error!("statistics save task failed: {}", e),
                            _ => {}
                        }
                    }
                    Some(FlushRequest::All) => save_all_blocking(stats.clone(), store.clone()).await,
                    None => break,
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn save_all_blocking(stats: Arc<Statistics>, store: Arc<Store>) {
    if let Err(e) = tokio::task::spawn_blocking(move || stats.save_all(&store)).await {
        error!("statistics save task failed: {}", e);
    }
}

/// Verifies that a packet-capture runtime is present before opening handles.
#[cfg(windows)]
fn check_capture_runtime() -> Result<(), NetmonError> {
    const DLL_PATHS: [&str; 4] = [
        r"C:\Windows\System32\Npcap\wpcap.dll",
        r"C:\Windows\System32\wpcap.dll",
        r"C:\Windows\SysWOW64\Npcap\wpcap.dll",
        r"C:\Windows\SysWOW64\wpcap.dll",
    ];

    if DLL_PATHS.iter().any(|p| std::path::Path::new(p).exists()) {
        Ok(())
    } else {
        Err(NetmonError::CaptureLibraryMissing(
            "Npcap/WinPcap not found; install Npcap from https://npcap.com".to_string(),
        ))
    }
}

#[cfg(not(windows))]
fn check_capture_runtime() -> Result<(), NetmonError> {
    Ok(())
}
