//! Vision: frames, reference templates and template matching.
//!
//! The scan loop consumes this module through [`TemplateMatcher`], which pairs
//! a [`TemplateStore`] with the matching kernels.

pub mod bias;
pub mod correlate;
pub mod frame;
pub mod matcher;
pub mod template_store;

pub use bias::{read_bias_file, DeviceBias};
pub use frame::BgrFrame;
pub use matcher::{
    multi_scale_match, track_match, ConfidenceTier, MatchOutcome, PadCandidate, PadMatch,
    TemplateMatcher,
};
pub use template_store::{RefreshReport, Template, TemplateRole, TemplateStore};
