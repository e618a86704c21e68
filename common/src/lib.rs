// Copyright 2024 Oxide Computer Company
use slog::{o, Drain, Logger};

/// Default TCP port the replica serves client I/O on.
pub const DEFAULT_IO_PORT: u16 = 6061;

/// Default TCP port the replica serves rebuild (donor) traffic on.
pub const DEFAULT_REBUILD_PORT: u16 = 6062;

/// Default granularity at which a rebuild recipient asks a donor for diffs.
pub const DEFAULT_REBUILD_STEP_SIZE: u64 = 10 * 1024 * 1024 * 1024; // 10 GiB

#[derive(thiserror::Error, Debug, PartialEq, Clone)]
pub enum ReplicaError {
    #[error("Error: {0}")]
    GenericError(String),

    #[error("IO Error: {0}")]
    IoError(String),

    #[error("unsupported replica protocol version {0}")]
    BadVersion(u16),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("malformed write payload")]
    BadWritePayload,

    #[error("volume {0} not found")]
    VolumeNotFound(String),

    #[error("volume is offline")]
    Offline,

    #[error("volume already has a data connection")]
    DataConnBusy,

    #[error("offset {0} past end of volume")]
    OffsetInvalid(u64),

    #[error("store operation failed: {0}")]
    StoreError(String),
}

impl From<std::io::Error> for ReplicaError {
    fn from(e: std::io::Error) -> Self {
        ReplicaError::IoError(format!("{:?}", e))
    }
}

impl From<anyhow::Error> for ReplicaError {
    fn from(e: anyhow::Error) -> Self {
        ReplicaError::GenericError(format!("{:?}", e))
    }
}

#[macro_export]
macro_rules! replica_bail {
    ($i:ident) => { return Err($crate::ReplicaError::$i) };
    ($i:ident, $str:expr) => {
        return Err($crate::ReplicaError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::ReplicaError::$i(format!($fmt, $($arg)*)))
    };
}

/// Builds a terminal logger for the daemon and tests.
pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Plain synchronous logger, for contexts where the async drain would
/// drop messages on panic (tests, early daemon exit paths).
pub fn build_plain_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
}
