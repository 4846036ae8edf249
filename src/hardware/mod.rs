//! Hardware collaborators consumed by the scan loop.
//!
//! The scan controller only needs four primitives: absolute moves with
//! position read-back, a voltage source with current read-back, a relay, and a
//! camera. Each is a capability trait so the loop runs the same against the
//! serial scanning stage or the simulated devices in [`mock`].

pub mod lock;
pub mod mock;
pub mod relay;
pub mod stage;

pub use lock::{HardwareLock, Transport};
pub use relay::LcusRelay;
pub use stage::ScanningStage;

use crate::error::AppResult;
use crate::grid::StagePoint;
use crate::vision::BgrFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Positioner axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Stage X
    X,
    /// Stage Y
    Y,
    /// Needle height
    Z,
}

impl Axis {
    /// Output channel driving this axis.
    pub fn channel(self) -> u8 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        };
        f.write_str(name)
    }
}

/// Three-axis position in stage units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    /// X
    pub x: f64,
    /// Y
    pub y: f64,
    /// Z
    pub z: f64,
}

impl StagePosition {
    /// Planar component.
    pub fn xy(&self) -> StagePoint {
        StagePoint::new(self.x, self.y)
    }

    /// Copy with one axis replaced.
    pub fn with_axis(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
        self
    }

    /// Value along one axis.
    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

/// Absolute positioning with read-back.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Move one axis to `target`; returns the position actually commanded.
    async fn move_absolute(&self, axis: Axis, target: f64) -> AppResult<f64>;

    /// Current position.
    async fn read_position(&self) -> AppResult<StagePosition>;
}

/// Voltage source with current measurement.
#[async_trait]
pub trait SourceMeter: Send + Sync {
    /// Compliance current limit in amps.
    async fn set_compliance(&self, amps: f64) -> AppResult<()>;

    /// Source `volts` on the output.
    async fn apply_voltage(&self, volts: f64) -> AppResult<()>;

    /// Measured current in amps.
    async fn read_current(&self) -> AppResult<f64>;
}

/// Two-state signal routing relay.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Energise (`true`) or release the relay.
    async fn set_relay(&self, on: bool) -> AppResult<()>;
}

/// Camera frame acquisition.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Grab the next BGR frame.
    async fn capture_frame(&self) -> AppResult<BgrFrame>;
}

/// The set of collaborators a scan drives.
#[derive(Clone)]
pub struct Instruments {
    /// Stage and needle positioner
    pub positioner: Arc<dyn Positioner>,
    /// Source-measure unit
    pub meter: Arc<dyn SourceMeter>,
    /// Routing relay
    pub relay: Arc<dyn Relay>,
    /// Camera
    pub camera: Arc<dyn FrameSource>,
}

impl std::fmt::Debug for Instruments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruments").finish_non_exhaustive()
    }
}
