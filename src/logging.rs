use crate::config::LogSettings;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::Once;

static INIT: Once = Once::new();
static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

/// Initializes the process-wide logger from the configured sinks and levels.
///
/// Safe to call more than once; the first call wins and later calls return
/// the memoized result.
pub fn setup_logging(settings: &LogSettings) -> Result<(), Box<dyn std::error::Error>> {
    INIT.call_once(|| {
        let result = build_and_install(settings);
        *INIT_RESULT.lock().unwrap() = Some(result);
    });

    let guard = INIT_RESULT.lock().unwrap();
    match guard.as_ref() {
        Some(Ok(())) => Ok(()),
        Some(Err(msg)) => Err(Box::new(std::io::Error::other(msg.clone()))),
        None => Err(Box::new(std::io::Error::other("logging not initialized"))),
    }
}

fn build_and_install(settings: &LogSettings) -> Result<(), String> {
    let mut builder = Config::builder();
    let mut root = Root::builder();

    if settings.enable_console {
        // {h(...)} applies the per-level highlight colors on ANSI terminals.
        let pattern = if settings.use_colors {
            "{d(%Y-%m-%d %H:%M:%S%.3f)} [{h({l})}] {m}{n}"
        } else {
            "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {m}{n}"
        };
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    if settings.enable_file {
        let path = settings
            .log_file_path
            .as_deref()
            .ok_or_else(|| "log file path must be set when file logging is enabled".to_string())?;

        if let Some(dir) = Path::new(path).parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("failed to create log directory: {}", e))?;
        }

        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(
                "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {m}{n}",
            )))
            .append(true)
            .build(path)
            .map_err(|e| format!("failed to open log file: {}", e))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(logfile)));
        root = root.appender("file");
    }

    let config = builder
        .build(root.build(level_filter(settings)))
        .map_err(|e| format!("failed to build log config: {}", e))?;

    log4rs::init_config(config).map_err(|e| format!("logging initialization failed: {}", e))?;
    Ok(())
}

/// The `log` facade filters hierarchically, so the most verbose enabled
/// level determines the root filter.
fn level_filter(settings: &LogSettings) -> LevelFilter {
    if settings.enable_trace {
        LevelFilter::Trace
    } else if settings.enable_debug {
        LevelFilter::Debug
    } else if settings.enable_info {
        LevelFilter::Info
    } else if settings.enable_warning {
        LevelFilter::Warn
    } else if settings.enable_error {
        LevelFilter::Error
    } else {
        LevelFilter::Off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_verbose_enabled_level_wins() {
        let mut settings = LogSettings::default();
        assert_eq!(level_filter(&settings), LevelFilter::Info);

        settings.enable_trace = true;
        assert_eq!(level_filter(&settings), LevelFilter::Trace);

        settings.enable_trace = false;
        settings.enable_debug = true;
        assert_eq!(level_filter(&settings), LevelFilter::Debug);

        settings.enable_debug = false;
        settings.enable_info = false;
        settings.enable_warning = false;
        settings.enable_error = false;
        assert_eq!(level_filter(&settings), LevelFilter::Off);
    }
}
