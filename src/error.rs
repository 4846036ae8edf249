//! Custom error types for the probe scanning engine.
//!
//! `ProbeError` is the single error type returned by the library. It follows the
//! taxonomy the scan loop needs to branch on:
//!
//! - **`Transport`** / **`LockTimeout`**: the positioner channel failed after the
//!   bounded retries, or the hardware lock could not be acquired in time. The scan
//!   controller turns a transport failure into a point-level skip and halts on a
//!   lock timeout.
//! - **`Calibration`**: malformed anchors or grid dimensions, detected at plan time
//!   before any scan starts.
//! - **`Template`** / **`Image`**: a template role is not loaded or an image file
//!   could not be decoded.
//! - **`Instrument`**: a collaborator (source meter, relay, camera) reported a
//!   failure.
//!
//! Vision non-matches are *not* errors; they are returned as
//! [`crate::vision::MatchOutcome::NotFound`].

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, ProbeError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Transport write failed after {attempts} attempts: {reason}")]
    Transport { attempts: u32, reason: String },

    #[error("Timed out acquiring hardware lock '{channel}' after {timeout_ms}ms")]
    LockTimeout { channel: String, timeout_ms: u64 },

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Template '{0}' is not loaded")]
    Template(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Scan aborted: {0}")]
    ScanAborted(String),
}

impl From<figment::Error> for ProbeError {
    fn from(err: figment::Error) -> Self {
        ProbeError::Config(Box::new(err))
    }
}

impl ProbeError {
    /// Whether the scan loop may continue with the next point after this error.
    ///
    /// Lock exhaustion and aborts stop the scan; everything else is recorded
    /// against the current point.
    pub fn is_point_recoverable(&self) -> bool {
        !matches!(
            self,
            ProbeError::LockTimeout { .. } | ProbeError::ScanAborted(_)
        )
    }
}
