//! Multi-field scanning stage over the bracket command protocol.
//!
//! A move is the sequence `[nch:N]`, `[start]`, `[target:chC:V]`, dwell,
//! `[stop]`. Each command is a separate lock acquisition; the dwell is spent
//! with the lock released.
//!
//! The stage is open loop and has no position query, so read-back reports the
//! last commanded target per axis. That record lives in the [`ScanningStage`]
//! and is shared by its clones: build one stage per link and hand clones to
//! every caller that moves it (scan loop, manual jog). Raw target commands
//! written to the [`HardwareLock`] directly bypass the record.

use crate::config::{PositionerConfig, TemperatureMode};
use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::lock::HardwareLock;
use super::{Axis, Positioner, StagePosition};

/// Serial scanning stage driver. Clones drive the same stage and share its
/// commanded-target record.
#[derive(Debug, Clone)]
pub struct ScanningStage {
    lock: HardwareLock,
    channel_count: u32,
    mode: TemperatureMode,
    dwell: Duration,
    targets: Arc<RwLock<StagePosition>>,
}

impl ScanningStage {
    /// Driver over `lock` with the settings from `config`.
    pub fn new(lock: HardwareLock, config: &PositionerConfig) -> Self {
        Self {
            lock,
            channel_count: config.channel_count,
            mode: config.temperature_mode,
            dwell: config.motion_dwell(),
            targets: Arc::new(RwLock::new(StagePosition::default())),
        }
    }

    /// Active temperature mode.
    pub fn mode(&self) -> TemperatureMode {
        self.mode
    }

    /// Clamp a target into the travel range of the active mode.
    pub fn clamp(&self, target: f64) -> f64 {
        let (lo, hi) = self.mode.travel_range();
        target.clamp(lo, hi)
    }

    /// Enable the output channels and the drive.
    pub async fn enable(&self) -> AppResult<()> {
        self.lock
            .write_command(&format!("[nch:{}]", self.channel_count))
            .await?;
        self.lock.write_command("[start]").await
    }

    /// Stop the drive.
    pub async fn disable(&self) -> AppResult<()> {
        self.lock.write_command("[stop]").await
    }
}

#[async_trait]
impl Positioner for ScanningStage {
    async fn move_absolute(&self, axis: Axis, target: f64) -> AppResult<f64> {
        let commanded = self.clamp(target);
        if commanded != target {
            warn!(%axis, target, commanded, mode = ?self.mode, "Target clamped to travel range");
        }

        self.enable().await?;
        let sent = self
            .lock
            .write_command(&format!("[target:ch{}:{:.6}]", axis.channel(), commanded))
            .await;
        if sent.is_ok() {
            sleep(self.dwell).await;
        }
        // Always try to stop the drive, even when the target write failed
        let stopped = self.disable().await;
        sent?;
        stopped?;

        let mut targets = self.targets.write().await;
        *targets = targets.with_axis(axis, commanded);
        debug!(%axis, commanded, "Stage target reached");
        Ok(commanded)
    }

    async fn read_position(&self) -> AppResult<StagePosition> {
        Ok(*self.targets.read().await)
    }
}
