//! Scan lifecycle events.
//!
//! Events go out on a broadcast channel. Sending never waits for receivers, so
//! a slow UI or logger cannot hold up the scan.

use crate::error::ProbeError;
use crate::grid::StagePoint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// One point of an I–V sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IvSample {
    /// Applied voltage
    pub volts: f64,
    /// Measured current
    pub amps: f64,
}

/// Outcome of a visited point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointResult {
    /// Visit index
    pub index: usize,
    /// Device label
    pub name: String,
    /// Stage position after re-centering
    pub position: StagePoint,
    /// Vision re-centering succeeded
    pub matched: bool,
    /// Current exceeded the contact threshold
    pub contacted: bool,
    /// Current read while pressed, if the electrical test ran
    pub current: Option<f64>,
    /// Sweep samples taken while contacted
    pub iv_curve: Vec<IvSample>,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

/// Why a point was skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Needle not located after the coarse move
    NeedleNotFound {
        /// Best tracking score
        best_score: f32,
    },
    /// No pad located in the frame
    NoPads,
    /// Needle not located after pressing
    NeedleLostAfterPress {
        /// Best tracking score
        best_score: f32,
    },
    /// Positioner command failed after retries
    Transport {
        /// Error text
        message: String,
    },
    /// A reference template was missing or unreadable
    Vision {
        /// Error text
        message: String,
    },
    /// A collaborator reported a failure
    Instrument {
        /// Error text
        message: String,
    },
}

impl SkipReason {
    /// Classify a recoverable point error.
    pub fn for_error(err: &ProbeError) -> Self {
        let message = err.to_string();
        match err {
            ProbeError::Transport { .. } => SkipReason::Transport { message },
            ProbeError::Template(_) | ProbeError::Image(_) => SkipReason::Vision { message },
            _ => SkipReason::Instrument { message },
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NeedleNotFound { best_score } => {
                write!(f, "needle not found (best score {:.3})", best_score)
            }
            SkipReason::NoPads => f.write_str("no pad detected"),
            SkipReason::NeedleLostAfterPress { best_score } => {
                write!(f, "needle lost after press (best score {:.3})", best_score)
            }
            SkipReason::Transport { message } => write!(f, "transport failure: {}", message),
            SkipReason::Vision { message } => write!(f, "vision failure: {}", message),
            SkipReason::Instrument { message } => write!(f, "instrument failure: {}", message),
        }
    }
}

/// Why the worker exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// Every remaining point was visited
    Completed,
    /// `stop()` was called
    Requested,
    /// The shared stop signal was raised
    ExternalStop,
    /// A non-recoverable error ended the scan
    Halted(String),
}

/// Lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Worker started
    Started {
        /// First visit index
        start_index: usize,
        /// Number of points in the plan
        total: usize,
    },
    /// Point visited
    PointResult(PointResult),
    /// Point skipped
    PointSkipped {
        /// Visit index
        index: usize,
        /// Device label
        name: String,
        /// Cause
        reason: SkipReason,
    },
    /// Worker exited
    Stopped {
        /// Cause
        reason: StopReason,
        /// First index not visited
        next_index: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_for_error() {
        let missing = ProbeError::Template("needle".to_string());
        assert!(matches!(SkipReason::for_error(&missing), SkipReason::Vision { .. }));

        let transport = ProbeError::Transport {
            attempts: 3,
            reason: "broken pipe".to_string(),
        };
        assert!(matches!(SkipReason::for_error(&transport), SkipReason::Transport { .. }));

        let meter = ProbeError::Instrument("meter offline".to_string());
        assert_eq!(
            SkipReason::for_error(&meter).to_string(),
            "instrument failure: Instrument error: meter offline"
        );
    }
}
