//! Vision re-centering of the needle onto the nearest pad.
//!
//! One pass captures a frame, tracks the needle, detects pads, picks the pad
//! closest to the needle and moves the stage by the pixel offset converted to
//! stage units. Template files are refreshed first, then matching runs on
//! the blocking pool.

use crate::config::VisionConfig;
use crate::error::{AppResult, ProbeError};
use crate::hardware::{Axis, Instruments};
use crate::vision::{BgrFrame, MatchOutcome, PadMatch, TemplateMatcher, TemplateRole};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::state::PositionState;

/// Result of a re-centering pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecenterOutcome {
    /// Correction applied, in stage units
    Corrected {
        /// X correction
        dx: f64,
        /// Y correction
        dy: f64,
        /// Needle tracking score
        confidence: f32,
    },
    /// Needle not found; nothing moved
    NeedleNotFound {
        /// Best tracking score
        best_score: f32,
    },
    /// Needle found but no pad in view; nothing moved
    NoPads,
}

impl RecenterOutcome {
    /// Whether a correction was applied.
    pub fn is_corrected(&self) -> bool {
        matches!(self, RecenterOutcome::Corrected { .. })
    }
}

/// Pad whose center is closest to `needle`; ties keep detection order.
pub fn nearest_pad(pads: &[PadMatch], needle: (i32, i32)) -> Option<&PadMatch> {
    let dist = |p: &PadMatch| {
        let dx = (p.center.0 - needle.0) as i64;
        let dy = (p.center.1 - needle.1) as i64;
        dx * dx + dy * dy
    };
    let mut best: Option<&PadMatch> = None;
    for pad in pads {
        if best.map_or(true, |b| dist(pad) < dist(b)) {
            best = Some(pad);
        }
    }
    best
}

/// Camera-to-stage correction engine.
#[derive(Debug, Clone)]
pub struct Recenterer {
    matcher: Arc<TemplateMatcher>,
    needle_bias: (i32, i32),
    units_per_px: (f64, f64),
    invert_x: bool,
    invert_y: bool,
}

impl Recenterer {
    /// Engine over `matcher` with the camera mapping from `vision`.
    pub fn new(matcher: Arc<TemplateMatcher>, vision: &VisionConfig) -> Self {
        Self {
            matcher,
            needle_bias: vision.needle_bias_px,
            units_per_px: vision.stage_units_per_px,
            invert_x: vision.invert_x,
            invert_y: vision.invert_y,
        }
    }

    /// The matcher, for cache maintenance.
    pub fn matcher(&self) -> &Arc<TemplateMatcher> {
        &self.matcher
    }

    /// Convert a pixel offset to a stage offset.
    pub fn pixel_to_stage(&self, dx_px: i32, dy_px: i32) -> (f64, f64) {
        let sx = if self.invert_x { -1.0 } else { 1.0 };
        let sy = if self.invert_y { -1.0 } else { 1.0 };
        (
            sx * dx_px as f64 * self.units_per_px.0,
            sy * dy_px as f64 * self.units_per_px.1,
        )
    }

    /// Compute the stage correction for one frame without moving anything.
    pub fn plan_correction(&self, frame: &BgrFrame) -> AppResult<RecenterOutcome> {
        let (needle, confidence) = match self
            .matcher
            .track(frame, TemplateRole::Needle, self.needle_bias)?
        {
            MatchOutcome::Found {
                center, confidence, ..
            } => (center, confidence),
            MatchOutcome::NotFound { best_score } => {
                debug!(best_score, "Needle not found");
                return Ok(RecenterOutcome::NeedleNotFound { best_score });
            }
        };

        let pads = self.matcher.find_pads(frame)?;
        let Some(pad) = nearest_pad(&pads, needle) else {
            return Ok(RecenterOutcome::NoPads);
        };

        let (dx, dy) = self.pixel_to_stage(pad.center.0 - needle.0, pad.center.1 - needle.1);
        debug!(
            needle_x = needle.0,
            needle_y = needle.1,
            pad_x = pad.center.0,
            pad_y = pad.center.1,
            dx,
            dy,
            "Correction planned"
        );
        Ok(RecenterOutcome::Corrected {
            dx,
            dy,
            confidence,
        })
    }

    /// Capture, match and apply the correction as absolute moves.
    pub async fn recenter(
        &self,
        instruments: &Instruments,
        positions: &PositionState,
    ) -> AppResult<RecenterOutcome> {
        let frame = instruments.camera.capture_frame().await?;
        let engine = self.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            engine.matcher.refresh_templates();
            engine.plan_correction(&frame)
        })
            .await
            .map_err(|e| ProbeError::Instrument(format!("Matcher task failed: {}", e)))??;

        if let RecenterOutcome::Corrected { dx, dy, confidence } = outcome {
            let here = positions.refresh(instruments.positioner.as_ref()).await?;
            instruments
                .positioner
                .move_absolute(Axis::X, here.x + dx)
                .await?;
            instruments
                .positioner
                .move_absolute(Axis::Y, here.y + dy)
                .await?;
            positions.refresh(instruments.positioner.as_ref()).await?;
            info!(dx, dy, confidence, "Re-centered on pad");
        }
        Ok(outcome)
    }
}
