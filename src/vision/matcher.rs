//! Template matching for needle tracking and pad detection.
//!
//! Two modes share the correlation kernel in [`super::correlate`]:
//!
//! - **Tracking** ([`track_match`]): three-channel, native scale only, global
//!   maximum. Used on every frame while the needle moves, so it favours speed.
//! - **Pad detection** ([`multi_scale_match`]): grayscale, five template
//!   scales, threshold plus two rounds of greedy suppression. Runs once per
//!   frame and tolerates scale drift between the template and the fixture.
//!
//! A miss is an ordinary [`MatchOutcome::NotFound`] value, not an error.

use crate::config::TemplatePaths;
use crate::error::{AppResult, ProbeError};
use image::GrayImage;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use super::bias::{read_bias_file, DeviceBias};
use super::correlate::{ccoeff_normed_bgr, ccoeff_normed_gray, resize_gray, scaled_dims};
use super::frame::BgrFrame;
use super::template_store::{RefreshReport, TemplateRole, TemplateStore};

/// Scores at or below this are reported as no match by the tracker.
pub const TRACK_THRESHOLD: f32 = 0.6;

/// Minimum score for a pad candidate.
pub const PAD_THRESHOLD: f32 = 0.85;

/// Template scales tried by the pad detector, ascending.
pub const PAD_SCALES: [f64; 5] = [0.8, 0.9, 1.0, 1.1, 1.2];

/// Rescaled templates smaller than this on either side are skipped.
const MIN_SCALED_SIDE: u32 = 10;

/// Display bucket for a tracking score. Never used for control decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    /// Score ≥ 0.8
    High,
    /// Score ≥ 0.7
    Medium,
    /// Score above the tracking threshold
    Low,
}

impl ConfidenceTier {
    /// Bucket a score that already passed the tracking threshold.
    pub fn from_score(score: f32) -> Self {
        if score >= 0.8 {
            ConfidenceTier::High
        } else if score >= 0.7 {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }

    /// Annotation color name.
    pub fn color(self) -> &'static str {
        match self {
            ConfidenceTier::High => "green",
            ConfidenceTier::Medium => "orange",
            ConfidenceTier::Low => "red",
        }
    }

    /// Annotation color as a BGR triple.
    pub fn bgr(self) -> [u8; 3] {
        match self {
            ConfidenceTier::High => [0, 255, 0],
            ConfidenceTier::Medium => [0, 165, 255],
            ConfidenceTier::Low => [0, 0, 255],
        }
    }
}

/// Result of a tracking match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    /// Template located
    Found {
        /// Template center in frame pixels, bias included
        center: (i32, i32),
        /// Correlation score
        confidence: f32,
        /// Display bucket
        tier: ConfidenceTier,
        /// Template (height, width)
        template_size: (u32, u32),
    },
    /// Best score did not clear the threshold
    NotFound {
        /// Highest score seen
        best_score: f32,
    },
}

impl MatchOutcome {
    /// Whether the template was located.
    pub fn is_found(&self) -> bool {
        matches!(self, MatchOutcome::Found { .. })
    }

    /// Center of a found match.
    pub fn center(&self) -> Option<(i32, i32)> {
        match self {
            MatchOutcome::Found { center, .. } => Some(*center),
            MatchOutcome::NotFound { .. } => None,
        }
    }

    /// Correlation score, found or not.
    pub fn confidence(&self) -> f32 {
        match self {
            MatchOutcome::Found { confidence, .. } => *confidence,
            MatchOutcome::NotFound { best_score } => *best_score,
        }
    }
}

/// Single-scale three-channel match; the global maximum wins.
///
/// `bias` is added to the template center to compensate for parallax between
/// the camera axis and the needle tip.
pub fn track_match(frame: &BgrFrame, templ: &BgrFrame, bias: (i32, i32)) -> MatchOutcome {
    let Some(scores) = ccoeff_normed_bgr(frame, templ) else {
        debug!(
            frame_w = frame.width(),
            frame_h = frame.height(),
            templ_w = templ.width(),
            templ_h = templ.height(),
            "Template does not fit in frame"
        );
        return MatchOutcome::NotFound { best_score: 0.0 };
    };

    let (x, y, score) = scores.max_loc();
    if score > TRACK_THRESHOLD {
        let (w, h) = (templ.width(), templ.height());
        MatchOutcome::Found {
            center: (
                (x + w / 2) as i32 + bias.0,
                (y + h / 2) as i32 + bias.1,
            ),
            confidence: score,
            tier: ConfidenceTier::from_score(score),
            template_size: (h, w),
        }
    } else {
        MatchOutcome::NotFound { best_score: score }
    }
}

/// A thresholded correlation peak before suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PadCandidate {
    /// Correlation score
    pub score: f32,
    /// Top-left corner of the placement
    pub top_left: (u32, u32),
    /// Effective template (width, height)
    pub size: (u32, u32),
    /// Template scale that produced it
    pub scale: f64,
}

impl PadCandidate {
    /// Integer center of the placement.
    pub fn center(&self) -> (i64, i64) {
        (
            (self.top_left.0 + self.size.0 / 2) as i64,
            (self.top_left.1 + self.size.1 / 2) as i64,
        )
    }
}

/// A detected pad.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PadMatch {
    /// Pad center in frame pixels, bias included
    pub center: (i32, i32),
    /// Correlation score
    pub score: f32,
    /// Template scale that produced it
    pub scale: f64,
    /// Effective template (width, height)
    pub size: (u32, u32),
}

fn greedy_suppress(
    mut candidates: Vec<PadCandidate>,
    reach: impl Fn(u32, u32) -> u32,
) -> Vec<PadCandidate> {
    // Stable, so equal scores keep encounter order
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<PadCandidate> = Vec::new();
    for cand in candidates {
        let (cx, cy) = cand.center();
        let overlaps = kept.iter().any(|sel| {
            let (sx, sy) = sel.center();
            (cx - sx).abs() < reach(cand.size.0, sel.size.0) as i64
                && (cy - sy).abs() < reach(cand.size.1, sel.size.1) as i64
        });
        if !overlaps {
            kept.push(cand);
        }
    }
    kept
}

/// Suppression within one scale: overlap when both center offsets are below
/// half the larger extent on that axis.
pub fn suppress_within_scale(candidates: Vec<PadCandidate>) -> Vec<PadCandidate> {
    greedy_suppress(candidates, |a, b| a.max(b) / 2)
}

/// Suppression across scales: same test with half the smaller extent.
pub fn suppress_global(candidates: Vec<PadCandidate>) -> Vec<PadCandidate> {
    greedy_suppress(candidates, |a, b| a.min(b) / 2)
}

fn candidates_at_scale(frame: &GrayImage, templ: &GrayImage, scale: f64) -> Vec<PadCandidate> {
    let Some(scores) = ccoeff_normed_gray(frame, templ) else {
        return Vec::new();
    };
    let size = (templ.width(), templ.height());
    scores
        .at_or_above(PAD_THRESHOLD)
        .into_iter()
        .map(|(x, y, score)| PadCandidate {
            score,
            top_left: (x, y),
            size,
            scale,
        })
        .collect()
}

fn scaled_template(templ: &GrayImage, scale: f64) -> Option<GrayImage> {
    if scale == 1.0 {
        return Some(templ.clone());
    }
    let (w, h) = scaled_dims(templ.width(), templ.height(), scale);
    if w < MIN_SCALED_SIDE || h < MIN_SCALED_SIDE {
        return None;
    }
    Some(resize_gray(templ, w, h))
}

fn match_prepared(
    frame: &GrayImage,
    scaled: &[(f64, Arc<GrayImage>)],
    bias: DeviceBias,
) -> Vec<PadMatch> {
    let mut pooled = Vec::new();
    for (scale, templ) in scaled {
        let raw = candidates_at_scale(frame, templ, *scale);
        let kept = suppress_within_scale(raw);
        trace!(scale, kept = kept.len(), "Pad candidates after scale suppression");
        pooled.extend(kept);
    }

    suppress_global(pooled)
        .into_iter()
        .map(|c| {
            let (cx, cy) = c.center();
            PadMatch {
                center: (cx as i32 + bias.x, cy as i32 + bias.y),
                score: c.score,
                scale: c.scale,
                size: c.size,
            }
        })
        .collect()
}

/// Multi-scale grayscale pad detection.
///
/// Returns one center per detected pad, highest score first.
pub fn multi_scale_match(frame: &BgrFrame, templ: &BgrFrame, bias: DeviceBias) -> Vec<PadMatch> {
    let gray_templ = templ.to_gray();
    let scaled: Vec<(f64, Arc<GrayImage>)> = PAD_SCALES
        .iter()
        .filter_map(|&s| scaled_template(&gray_templ, s).map(|t| (s, Arc::new(t))))
        .collect();
    match_prepared(&frame.to_gray(), &scaled, bias)
}

fn scale_key(scale: f64) -> u32 {
    (scale * 100.0).round() as u32
}

/// Matcher bound to a [`TemplateStore`], with a cache of rescaled pad
/// templates keyed by template generation and scale.
#[derive(Debug)]
pub struct TemplateMatcher {
    store: Arc<TemplateStore>,
    sources: Option<TemplatePaths>,
    bias_file: PathBuf,
    scaled: Mutex<HashMap<(u64, u32), Arc<GrayImage>>>,
}

impl TemplateMatcher {
    /// Matcher over `store`, reading the pad bias from `bias_file` per call.
    pub fn new(store: Arc<TemplateStore>, bias_file: impl Into<PathBuf>) -> Self {
        Self {
            store,
            sources: None,
            bias_file: bias_file.into(),
            scaled: Mutex::new(HashMap::new()),
        }
    }

    /// Keep the store in sync with template files on disk. Every
    /// [`refresh_templates`](Self::refresh_templates) call reloads the roles
    /// whose file changed.
    pub fn with_sources(mut self, paths: TemplatePaths) -> Self {
        self.sources = Some(paths);
        self
    }

    /// Reload changed template files, if file sources are configured.
    pub fn refresh_templates(&self) -> Option<RefreshReport> {
        let paths = self.sources.as_ref()?;
        let report = self.store.load_or_refresh(paths);
        if !report.reloaded.is_empty() {
            debug!(reloaded = ?report.reloaded, "Templates refreshed");
        }
        Some(report)
    }

    /// Underlying template store.
    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    /// Track the template of `role` in `frame`.
    pub fn track(&self, frame: &BgrFrame, role: TemplateRole, bias: (i32, i32)) -> AppResult<MatchOutcome> {
        let templ = self
            .store
            .get(role)
            .ok_or_else(|| ProbeError::Template(role.to_string()))?;
        Ok(track_match(frame, &templ.image, bias))
    }

    /// Detect every pad in `frame`.
    pub fn find_pads(&self, frame: &BgrFrame) -> AppResult<Vec<PadMatch>> {
        let templ = self
            .store
            .get(TemplateRole::Pad)
            .ok_or_else(|| ProbeError::Template(TemplateRole::Pad.to_string()))?;
        let bias = read_bias_file(&self.bias_file);
        let scaled = self.scaled_templates(templ.generation, &templ.image);
        let pads = match_prepared(&frame.to_gray(), &scaled, bias);
        debug!(count = pads.len(), bias_x = bias.x, bias_y = bias.y, "Pads detected");
        Ok(pads)
    }

    fn scaled_templates(&self, generation: u64, image: &BgrFrame) -> Vec<(f64, Arc<GrayImage>)> {
        let mut cache = match self.scaled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.retain(|(g, _), _| *g == generation);

        let mut gray = None;
        let mut out = Vec::with_capacity(PAD_SCALES.len());
        for scale in PAD_SCALES {
            let key = (generation, scale_key(scale));
            if let Some(t) = cache.get(&key) {
                out.push((scale, Arc::clone(t)));
                continue;
            }
            let base = gray.get_or_insert_with(|| image.to_gray());
            if let Some(t) = scaled_template(base, scale) {
                let t = Arc::new(t);
                cache.insert(key, Arc::clone(&t));
                out.push((scale, t));
            }
        }
        out
    }

    /// Number of cached rescaled templates.
    pub fn cached_templates(&self) -> usize {
        self.scaled.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Drop every cached rescaled template, returning how many were held.
    pub fn purge_cache(&self) -> usize {
        match self.scaled.lock() {
            Ok(mut cache) => {
                let n = cache.len();
                cache.clear();
                n
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_frame(width: u32, height: u32, seed: u32) -> BgrFrame {
        let mut state = seed;
        let data = (0..width * height * 3)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect();
        BgrFrame::new(width, height, data).unwrap()
    }

    fn candidate(score: f32, x: u32, y: u32, size: u32) -> PadCandidate {
        PadCandidate {
            score,
            top_left: (x, y),
            size: (size, size),
            scale: 1.0,
        }
    }

    #[test]
    fn test_tiers() {
        assert_eq!(ConfidenceTier::from_score(0.95), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(0.8), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(0.75), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(0.61), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::Medium.color(), "orange");
    }

    #[test]
    fn test_track_match_applies_bias() {
        let templ = noise_frame(12, 10, 99);
        let mut frame = BgrFrame::filled(64, 48, [90, 90, 90]);
        frame.blit(&templ, 20, 15);

        let outcome = track_match(&frame, &templ, (3, -2));
        match outcome {
            MatchOutcome::Found {
                center,
                confidence,
                tier,
                template_size,
            } => {
                assert_eq!(center, (20 + 6 + 3, 15 + 5 - 2));
                assert!(confidence > 0.99);
                assert_eq!(tier, ConfidenceTier::High);
                assert_eq!(template_size, (10, 12));
            }
            other => panic!("expected a match, got {:?}", other),
        }
    }

    #[test]
    fn test_track_match_reports_best_score_on_miss() {
        let templ = noise_frame(8, 8, 5);
        let frame = noise_frame(40, 40, 1234);
        let outcome = track_match(&frame, &templ, (0, 0));
        assert!(!outcome.is_found());
        assert!(outcome.confidence() <= TRACK_THRESHOLD);
        assert_eq!(outcome.center(), None);
    }

    #[test]
    fn test_within_scale_suppression_keeps_best() {
        let kept = suppress_within_scale(vec![
            candidate(0.90, 10, 10, 20),
            candidate(0.95, 14, 12, 20),
            candidate(0.88, 60, 10, 20),
        ]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].top_left, (14, 12));
        assert_eq!(kept[1].top_left, (60, 10));
    }

    #[test]
    fn test_global_suppression_uses_smaller_extent() {
        // Centers 9 apart: inside half of 24, outside half of 16
        let big = PadCandidate {
            score: 0.9,
            top_left: (0, 0),
            size: (24, 24),
            scale: 1.2,
        };
        let small = PadCandidate {
            score: 0.88,
            top_left: (13, 13),
            size: (16, 16),
            scale: 0.8,
        };
        assert_eq!(big.center(), (12, 12));
        assert_eq!(small.center(), (21, 21));
        assert_eq!(suppress_within_scale(vec![big, small]).len(), 1);
        assert_eq!(suppress_global(vec![big, small]).len(), 2);
    }

    #[test]
    fn test_equal_scores_keep_encounter_order() {
        let kept = suppress_global(vec![candidate(0.9, 0, 0, 20), candidate(0.9, 2, 2, 20)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].top_left, (0, 0));
    }

    #[test]
    fn test_matcher_requires_loaded_role() {
        let matcher = TemplateMatcher::new(Arc::new(TemplateStore::new()), "absent-bias.txt");
        let frame = BgrFrame::filled(20, 20, [0, 0, 0]);
        assert!(matches!(
            matcher.track(&frame, TemplateRole::Needle, (0, 0)),
            Err(ProbeError::Template(_))
        ));
        assert!(matches!(matcher.find_pads(&frame), Err(ProbeError::Template(_))));
    }

    #[test]
    fn test_scale_cache_follows_generation() {
        let store = Arc::new(TemplateStore::new());
        store.insert(TemplateRole::Pad, noise_frame(20, 20, 8));
        let dir = tempfile::TempDir::new().unwrap();
        let matcher = TemplateMatcher::new(Arc::clone(&store), dir.path().join("bias.txt"));
        let frame = BgrFrame::filled(60, 60, [50, 50, 50]);

        matcher.find_pads(&frame).unwrap();
        assert_eq!(matcher.cached_templates(), 5);

        store.insert(TemplateRole::Pad, noise_frame(11, 11, 9));
        matcher.find_pads(&frame).unwrap();
        // 11 * 0.8 and 11 * 0.9 fall below the minimum side
        assert_eq!(matcher.cached_templates(), 3);

        assert_eq!(matcher.purge_cache(), 3);
        assert_eq!(matcher.cached_templates(), 0);
    }
}
