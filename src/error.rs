use thiserror::Error;

/// Errors produced by the capture, attribution, and persistence layers.
///
/// Startup failures (`CaptureLibraryMissing`, `NoInterfacesFound`,
/// `StoreInitFailed`, `StoreMigrationFailed`) are fatal; everything else is
/// recovered per packet.
#[derive(Debug, Error)]
pub enum NetmonError {
    #[error("administrator privileges required for socket table lookups")]
    ElevationRequired,

    #[error("privilege check failed: {0}")]
    PrivilegeCheckFailed(String),

    #[error("packet capture runtime not available: {0}")]
    CaptureLibraryMissing(String),

    #[error("no capture-capable network interfaces found")]
    NoInterfacesFound,

    #[error("cannot open interface {name}: {reason}")]
    InterfaceOpenFailed { name: String, reason: String },

    #[error("socket table query failed with status {0}")]
    TableQueryFailed(u32),

    #[error("socket table data incomplete")]
    TableTruncated,

    #[error("socket table contains no entries")]
    TableEmpty,

    #[error("no owning process found for ports {local} -> {remote}")]
    NoMatchingFlow { local: u16, remote: u16 },

    #[error("process query failed for pid {pid}: {reason}")]
    ProcessQueryFailed { pid: u32, reason: String },

    #[error("socket table lookups are not supported on this platform")]
    UnsupportedPlatform,

    #[error("store initialization failed: {0}")]
    StoreInitFailed(String),

    #[error("store migration failed: {0}")]
    StoreMigrationFailed(String),
}
