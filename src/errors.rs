use std::io;

use thiserror::Error;

/// Errors surfaced by the session engine.
///
/// Recoverable conditions (a malformed protocol token, a device-reported
/// error line) are logged where they occur and never show up here.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Device address was empty or unusable. Fatal to the connect attempt.
    #[error("Invalid address")]
    InvalidAddress,
    /// The transport rejected a connect/send/disconnect call.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Flux computation over a window with fewer than two usable points.
    #[error("not enough data in selection")]
    InsufficientData,
    /// Storage read/write failed. Buffered measurements are retained.
    #[error("persistence failure: {0}")]
    Persistence(#[from] io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
