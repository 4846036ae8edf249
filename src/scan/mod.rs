//! Scan execution: the per-point move, re-center and measure loop.

pub mod controller;
pub mod events;
pub mod measure;
pub mod recenter;
pub mod state;

pub use controller::ScanController;
pub use events::{IvSample, PointResult, ScanEvent, SkipReason, StopReason};
pub use measure::{is_contact, Measurement, PressCycle, PressOutcome};
pub use recenter::{nearest_pad, RecenterOutcome, Recenterer};
pub use state::{PositionState, ScanState, StopSignal};
