//! Press, measure, retract.
//!
//! The needle is lowered to the contact height with the source biased, the
//! alignment is checked again, and the current decides whether the device is
//! contacted. On contact the relay is released for the I–V sweep and
//! re-energised afterwards. The needle is always retracted before returning;
//! a failed retract is reported as [`ProbeError::ScanAborted`] so the scan
//! stops with the probe possibly still down.

use crate::config::{ElectricalConfig, ScanConfig};
use crate::error::{AppResult, ProbeError};
use crate::hardware::{Axis, Instruments};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::events::IvSample;
use super::recenter::{RecenterOutcome, Recenterer};
use super::state::PositionState;

/// Electrical result of a pressed point.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Current read at the bias voltage
    pub current: f64,
    /// `|current|` above the contact threshold
    pub contacted: bool,
    /// Sweep samples, empty when not contacted or no sweep configured
    pub iv_curve: Vec<IvSample>,
}

/// Outcome of one press cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PressOutcome {
    /// Current measured
    Measured(Measurement),
    /// Re-centering after the press lost the needle
    NeedleLost {
        /// Best tracking score
        best_score: f32,
    },
    /// Re-centering after the press found no pad
    NoPads,
}

/// Whether `current` counts as electrical contact.
pub fn is_contact(current: f64, threshold: f64) -> bool {
    current.abs() > threshold
}

/// One press/measure/retract cycle.
pub struct PressCycle<'a> {
    /// Collaborators
    pub instruments: &'a Instruments,
    /// Re-centering engine
    pub recenterer: &'a Recenterer,
    /// Position bookkeeping
    pub positions: &'a PositionState,
    /// Heights and settle times
    pub scan: &'a ScanConfig,
    /// Bias, threshold and sweep
    pub electrical: &'a ElectricalConfig,
    /// Run the second re-centering while pressed
    pub recenter_when_pressed: bool,
}

impl PressCycle<'_> {
    /// Run the cycle. The needle is retracted on every path.
    pub async fn run(&self) -> AppResult<PressOutcome> {
        let pressed = self.press_and_measure().await;
        let retracted = self
            .instruments
            .positioner
            .move_absolute(Axis::Z, self.scan.retract_z)
            .await;

        match retracted {
            Ok(_) => {
                debug!(z = self.scan.retract_z, "Needle retracted");
                pressed
            }
            Err(e) => {
                error!(error = %e, "Retract failed");
                Err(ProbeError::ScanAborted(format!("retract failed: {}", e)))
            }
        }
    }

    async fn press_and_measure(&self) -> AppResult<PressOutcome> {
        let inst = self.instruments;
        let elec = self.electrical;

        inst.meter.set_compliance(elec.compliance_current).await?;
        inst.meter.apply_voltage(elec.bias_voltage).await?;
        inst.positioner
            .move_absolute(Axis::Z, self.scan.contact_z)
            .await?;

        if self.recenter_when_pressed {
            match self.recenterer.recenter(inst, self.positions).await? {
                RecenterOutcome::Corrected { .. } => {}
                RecenterOutcome::NeedleNotFound { best_score } => {
                    return Ok(PressOutcome::NeedleLost { best_score })
                }
                RecenterOutcome::NoPads => return Ok(PressOutcome::NoPads),
            }
            sleep(self.scan.post_move_settle()).await;
        } else {
            sleep(self.scan.pressure_settle()).await;
        }

        let current = inst.meter.read_current().await?;
        let contacted = is_contact(current, elec.contact_threshold_amps);
        info!(current, contacted, "Pressed current");

        let iv_curve = if contacted {
            self.relay_sweep().await?
        } else {
            warn!(current, threshold = elec.contact_threshold_amps, "No electrical contact");
            Vec::new()
        };

        Ok(PressOutcome::Measured(Measurement {
            current,
            contacted,
            iv_curve,
        }))
    }

    async fn relay_sweep(&self) -> AppResult<Vec<IvSample>> {
        let inst = self.instruments;
        let elec = self.electrical;

        inst.relay.set_relay(false).await?;
        sleep(elec.relay_settle()).await;

        let swept = self.sweep().await;

        // Restore routing whatever the sweep did
        let restored = inst.relay.set_relay(true).await;
        sleep(elec.relay_settle()).await;

        let samples = swept?;
        restored?;
        Ok(samples)
    }

    async fn sweep(&self) -> AppResult<Vec<IvSample>> {
        let inst = self.instruments;
        let volts = &self.electrical.iv_sweep_volts;
        if volts.is_empty() {
            return Ok(Vec::new());
        }

        let mut samples = Vec::with_capacity(volts.len());
        for &v in volts {
            inst.meter.apply_voltage(v).await?;
            let amps = inst.meter.read_current().await?;
            samples.push(IvSample { volts: v, amps });
        }
        inst.meter.apply_voltage(self.electrical.bias_voltage).await?;
        debug!(samples = samples.len(), "I-V sweep done");
        Ok(samples)
    }
}
