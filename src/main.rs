use log::{error, info, warn};
use netmonitor::{capture, config::Config, logging, report};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "netmonitor.yaml";
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(windows)]
const SERVICE_NAME: &str = "NetMonitor";

fn main() {
    // Without --console the binary is expected to run under the service
    // supervisor; anything else is console (diagnostic) mode.
    #[cfg(windows)]
    {
        let console = std::env::args().any(|arg| arg == "--console");
        if !console {
            if let Err(e) = service::run() {
                eprintln!("failed to start service dispatcher: {}", e);
                std::process::exit(1);
            }
            return;
        }
    }

    std::process::exit(console_main());
}

/// Locates the configuration next to the executable, falling back to the
/// working directory and then to built-in defaults.
fn load_config() -> (Config, String) {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let candidates = [exe_dir.join(CONFIG_FILE), PathBuf::from(CONFIG_FILE)];
    for path in &candidates {
        if path.exists() {
            match Config::load(path) {
                Ok(config) => return (config, format!("configuration loaded from {}", path.display())),
                Err(e) => {
                    return (
                        Config::default(),
                        format!("failed to load {} ({}), using defaults", path.display(), e),
                    )
                }
            }
        }
    }
    (Config::default(), "no configuration file found, using defaults".to_string())
}

fn console_main() -> i32 {
    let (config, config_note) = load_config();

    if let Err(e) = logging::setup_logging(&config.logging) {
        eprintln!("failed to setup logging: {}", e);
        return 1;
    }
    info!("{}", config_note);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(async {
        let handle = match capture::start_capture(&config).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to start capture: {}", e);
                return 1;
            }
        };

        let reporter = tokio::spawn(report::run_reporter(handle.stats(), REPORT_INTERVAL));
        info!("capture running; press Ctrl-C to stop");

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {}", e);
        }
        info!("shutdown signal received");

        reporter.abort();
        capture::stop_capture(handle).await;
        0
    })
}

#[cfg(windows)]
mod service {
    use super::*;
    use std::ffi::OsString;
    use tokio::sync::mpsc;
    use windows_service::define_windows_service;
    use windows_service::service::{
        ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
        ServiceType,
    };
    use windows_service::service_control_handler::{self, ServiceControlHandlerResult};

    define_windows_service!(ffi_service_main, service_main);

    /// Hands the process over to the service control dispatcher.
    pub(super) fn run() -> windows_service::Result<()> {
        windows_service::service_dispatcher::start(SERVICE_NAME, ffi_service_main)
    }

    fn service_main(_arguments: Vec<OsString>) {
        let (config, config_note) = load_config();

        if let Err(e) = logging::setup_logging(&config.logging) {
            eprintln!("failed to setup logging: {}", e);
        }
        info!("{}", config_note);

        if let Err(e) = run_service(config) {
            error!("service failed: {}", e);
        }
    }

    fn run_service(config: Config) -> Result<(), Box<dyn std::error::Error>> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();

        let status_handle = service_control_handler::register(
            SERVICE_NAME,
            move |control_event| match control_event {
                ServiceControl::Stop | ServiceControl::Shutdown => {
                    info!("received stop/shutdown signal");
                    let _ = shutdown_tx.send(());
                    ServiceControlHandlerResult::NoError
                }
                // The pipeline keeps capturing across pause/continue.
                ServiceControl::Pause | ServiceControl::Continue => {
                    ServiceControlHandlerResult::NoError
                }
                ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
                _ => ServiceControlHandlerResult::NotImplemented,
            },
        )?;

        let set_state = |state: ServiceState, exit_code: u32| {
            let controls_accepted = if state == ServiceState::Running {
                ServiceControlAccept::STOP
                    | ServiceControlAccept::SHUTDOWN
                    | ServiceControlAccept::PAUSE_CONTINUE
            } else {
                ServiceControlAccept::empty()
            };
            let _ = status_handle.set_service_status(ServiceStatus {
                service_type: ServiceType::OWN_PROCESS,
                current_state: state,
                controls_accepted,
                exit_code: ServiceExitCode::Win32(exit_code),
                checkpoint: 0,
                wait_hint: Duration::default(),
                process_id: None,
            });
        };

        set_state(ServiceState::StartPending, 0);

        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

        let handle = match runtime.block_on(capture::start_capture(&config)) {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to start capture: {}", e);
                set_state(ServiceState::Stopped, 1);
                return Ok(());
            }
        };
        set_state(ServiceState::Running, 0);
        info!("service started");

        let reporter = runtime.spawn(report::run_reporter(handle.stats(), REPORT_INTERVAL));
        runtime.block_on(async {
            let _ = shutdown_rx.recv().await;
        });

        set_state(ServiceState::StopPending, 0);
        reporter.abort();
        runtime.block_on(capture::stop_capture(handle));
        set_state(ServiceState::Stopped, 0);
        info!("service stopped");
        Ok(())
    }
}
