//! Configuration for the probe scanning engine using Figment.
//!
//! Configuration is loaded from (in order of precedence, highest first):
//! 1. Environment variables prefixed with `PROBESCAN_` (nested keys separated by `__`)
//! 2. A TOML configuration file (default: `config/probe_scan.toml`)
//! 3. Built-in defaults
//!
//! ```text
//! PROBESCAN_APPLICATION__LOG_LEVEL=debug
//! PROBESCAN_SCAN__SKIP_ELECTRICAL=true
//! PROBESCAN_POSITIONER__TEMPERATURE_MODE=low
//! ```
//!
//! # Example
//!
//! ```no_run
//! use probe_scan::config::ProbeConfig;
//!
//! let config = ProbeConfig::load_from("config/probe_scan.toml")?;
//! println!("Log level: {}", config.application.log_level);
//! # Ok::<(), probe_scan::error::ProbeError>(())
//! ```

use crate::error::{AppResult, ProbeError};
use crate::error_recovery::RetryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Current magnitude above which a pressed probe counts as electrically contacted.
pub const DEFAULT_CONTACT_THRESHOLD_AMPS: f64 = 9e-10;

/// Resident memory above which vision re-centering is skipped for a point.
pub const DEFAULT_MEMORY_CEILING_MB: u64 = 600;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Template image locations
    pub templates: TemplatePaths,
    /// Matcher and camera-to-stage settings
    pub vision: VisionConfig,
    /// Positioner transport settings
    pub positioner: PositionerConfig,
    /// Scan loop timing and Z heights
    pub scan: ScanConfig,
    /// Electrical test parameters
    pub electrical: ElectricalConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "probe_scan".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// File locations of the three template roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemplatePaths {
    /// Needle tip template
    pub needle: PathBuf,
    /// Bond pad template
    pub pad: PathBuf,
    /// Light indicator template
    pub light: PathBuf,
}

impl Default for TemplatePaths {
    fn default() -> Self {
        Self {
            needle: PathBuf::from("templateNeedle.png"),
            pad: PathBuf::from("templatepad.png"),
            light: PathBuf::from("templateLight.png"),
        }
    }
}

/// Vision and camera-to-stage mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VisionConfig {
    /// Persisted pad alignment bias file (`x,y`)
    pub bias_file: PathBuf,
    /// Parallax compensation added to the needle match center, in pixels
    pub needle_bias_px: (i32, i32),
    /// Stage units per image pixel along (x, y)
    pub stage_units_per_px: (f64, f64),
    /// Camera x grows opposite to stage x
    pub invert_x: bool,
    /// Camera y grows opposite to stage y
    pub invert_y: bool,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            bias_file: PathBuf::from("Paddia.txt"),
            needle_bias_px: (0, 0),
            stage_units_per_px: (0.01, 0.01),
            invert_x: false,
            invert_y: false,
        }
    }
}

/// Drive settings of the positioner, selected by the cryostat state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureMode {
    /// Room temperature operation
    #[default]
    Room,
    /// Low temperature operation (wider travel)
    Low,
}

impl TemperatureMode {
    /// Allowed target range for the scanning stage axes.
    pub fn travel_range(self) -> (f64, f64) {
        match self {
            TemperatureMode::Room => (0.0, 75.0),
            TemperatureMode::Low => (-150.0, 150.0),
        }
    }
}

/// Positioner serial transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PositionerConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Transport read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Number of output channels enabled with `[nch:N]`
    pub channel_count: u32,
    /// Injected cryostat mode
    pub temperature_mode: TemperatureMode,
    /// Write attempts before a command is reported as failed
    pub max_attempts: u32,
    /// Pause between write attempts in milliseconds
    pub backoff_ms: u64,
    /// Time the stage is left driving a new target before `[stop]`
    pub motion_dwell_ms: u64,
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            port: "COM3".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 100,
            channel_count: 12,
            temperature_mode: TemperatureMode::Room,
            max_attempts: 3,
            backoff_ms: 50,
            motion_dwell_ms: 300,
        }
    }
}

impl PositionerConfig {
    /// Retry policy for individual command writes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_ms)
    }

    /// Dwell between issuing a target and stopping the drive.
    pub fn motion_dwell(&self) -> Duration {
        Duration::from_millis(self.motion_dwell_ms)
    }
}

/// Scan loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    /// Wait after the coarse move before re-centering
    pub settle_ms: u64,
    /// Wait after re-centering before pressing
    pub post_move_settle_ms: u64,
    /// Wait used instead of re-centering under memory pressure
    pub pressure_settle_ms: u64,
    /// Skip the press/measure/retract cycle
    pub skip_electrical: bool,
    /// Z height at which the needle contacts the pad
    pub contact_z: f64,
    /// Z height the needle retracts to between points
    pub retract_z: f64,
    /// Resident memory ceiling in megabytes
    pub memory_ceiling_mb: u64,
    /// Maximum wait for the hardware lock in milliseconds
    pub lock_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2000,
            post_move_settle_ms: 1000,
            pressure_settle_ms: 500,
            skip_electrical: false,
            contact_z: 0.0,
            retract_z: 1.0,
            memory_ceiling_mb: DEFAULT_MEMORY_CEILING_MB,
            lock_timeout_ms: 5000,
        }
    }
}

impl ScanConfig {
    /// Settling delay after the coarse move.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Settling delay after re-centering.
    pub fn post_move_settle(&self) -> Duration {
        Duration::from_millis(self.post_move_settle_ms)
    }

    /// Settling delay used when re-centering is skipped.
    pub fn pressure_settle(&self) -> Duration {
        Duration::from_millis(self.pressure_settle_ms)
    }

    /// Hardware lock acquisition timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Electrical test configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ElectricalConfig {
    /// Bias voltage applied while pressed, in volts
    pub bias_voltage: f64,
    /// Source meter compliance current, in amps
    pub compliance_current: f64,
    /// Contact classification threshold, in amps
    pub contact_threshold_amps: f64,
    /// Wait after each relay switch in milliseconds
    pub relay_settle_ms: u64,
    /// Voltages swept while the relay is switched; empty disables the sweep
    pub iv_sweep_volts: Vec<f64>,
}

impl Default for ElectricalConfig {
    fn default() -> Self {
        Self {
            bias_voltage: 0.1,
            compliance_current: 0.1,
            contact_threshold_amps: DEFAULT_CONTACT_THRESHOLD_AMPS,
            relay_settle_ms: 1000,
            iv_sweep_volts: Vec::new(),
        }
    }
}

impl ElectricalConfig {
    /// Settling delay after a relay switch.
    pub fn relay_settle(&self) -> Duration {
        Duration::from_millis(self.relay_settle_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ProbeConfig {
    /// Load configuration from the default location and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/probe_scan.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides still
    /// apply. The merged result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(ProbeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PROBESCAN_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ProbeError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.positioner.max_attempts == 0 {
            return Err(ProbeError::Configuration(
                "positioner.max_attempts must be at least 1".to_string(),
            ));
        }

        let (ux, uy) = self.vision.stage_units_per_px;
        if !(ux.is_finite() && uy.is_finite()) || ux <= 0.0 || uy <= 0.0 {
            return Err(ProbeError::Configuration(format!(
                "vision.stage_units_per_px must be positive, got ({}, {})",
                ux, uy
            )));
        }

        let threshold = self.electrical.contact_threshold_amps;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ProbeError::Configuration(format!(
                "electrical.contact_threshold_amps must be positive, got {}",
                threshold
            )));
        }

        if self.scan.memory_ceiling_mb == 0 {
            return Err(ProbeError::Configuration(
                "scan.memory_ceiling_mb must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
