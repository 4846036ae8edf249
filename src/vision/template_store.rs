//! Reference images keyed by role, refreshed on file modification time.

use crate::config::TemplatePaths;
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use super::frame::BgrFrame;

/// Logical role of a reference image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateRole {
    /// Probe needle tip
    Needle,
    /// Device bond pad
    Pad,
    /// Light indicator
    Light,
}

impl TemplateRole {
    /// Every role, in load order.
    pub const ALL: [TemplateRole; 3] = [TemplateRole::Needle, TemplateRole::Pad, TemplateRole::Light];

    /// Lowercase role name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateRole::Needle => "needle",
            TemplateRole::Pad => "pad",
            TemplateRole::Light => "light",
        }
    }

    fn path(self, paths: &TemplatePaths) -> &Path {
        match self {
            TemplateRole::Needle => &paths.needle,
            TemplateRole::Pad => &paths.pad,
            TemplateRole::Light => &paths.light,
        }
    }
}

impl std::fmt::Display for TemplateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded reference image. Never mutated after construction; a refresh
/// replaces the whole value.
#[derive(Debug, Clone)]
pub struct Template {
    /// Role this image serves
    pub role: TemplateRole,
    /// Pixel data
    pub image: BgrFrame,
    /// Modification time of the source file, if loaded from disk
    pub modified: Option<SystemTime>,
    /// Process-unique stamp, increasing with every load
    pub generation: u64,
    /// Wall-clock load time
    pub loaded_at: DateTime<Utc>,
}

impl Template {
    /// Image height in pixels.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Image width in pixels.
    pub fn width(&self) -> u32 {
        self.image.width()
    }
}

/// Outcome of one refresh pass, per role.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    /// Roles whose image was (re)loaded
    pub reloaded: Vec<TemplateRole>,
    /// Roles whose file was unchanged
    pub unchanged: Vec<TemplateRole>,
    /// Roles that could not be loaded; any previous copy is kept
    pub failed: Vec<(TemplateRole, String)>,
}

/// Role-keyed template cache.
///
/// Readers take an `Arc` snapshot, so a refresh never disturbs a match that is
/// already running.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: RwLock<HashMap<TemplateRole, Arc<Template>>>,
    sources: RwLock<HashMap<TemplateRole, PathBuf>>,
    failing: Mutex<HashSet<TemplateRole>>,
    generation: AtomicU64,
}

impl TemplateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every role whose file changed since the last load.
    ///
    /// Per-role failures are logged and reported; they never abort the pass.
    /// A role that keeps failing is logged at warn level once, then at debug.
    pub fn load_or_refresh(&self, paths: &TemplatePaths) -> RefreshReport {
        let mut report = RefreshReport::default();
        for role in TemplateRole::ALL {
            let path = role.path(paths);
            let result = self.refresh_role(role, path);
            let newly_failing = self.track_failure(role, result.is_err());
            match result {
                Ok(true) => report.reloaded.push(role),
                Ok(false) => report.unchanged.push(role),
                Err(e) => {
                    if newly_failing {
                        warn!(role = %role, path = %path.display(), error = %e, "Template not loaded");
                    } else {
                        debug!(role = %role, error = %e, "Template still not loadable");
                    }
                    report.failed.push((role, e.to_string()));
                }
            }
        }
        report
    }

    /// Record the role's load state; true when it just started failing.
    fn track_failure(&self, role: TemplateRole, failed: bool) -> bool {
        let mut failing = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        if failed {
            failing.insert(role)
        } else {
            failing.remove(&role);
            false
        }
    }

    fn refresh_role(&self, role: TemplateRole, path: &Path) -> AppResult<bool> {
        let modified = std::fs::metadata(path)?.modified()?;

        let same_source = self
            .sources
            .read()
            .map(|s| s.get(&role).map(PathBuf::as_path) == Some(path))
            .unwrap_or(false);
        if same_source {
            if let Some(current) = self.get(role) {
                if current.modified == Some(modified) {
                    debug!(role = %role, "Template unchanged");
                    return Ok(false);
                }
            }
        }

        let image = BgrFrame::open(path)?;
        info!(
            role = %role,
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "Template loaded"
        );
        self.install(role, image, Some(modified));
        if let Ok(mut sources) = self.sources.write() {
            sources.insert(role, path.to_path_buf());
        }
        Ok(true)
    }

    /// Install an in-memory template, replacing any current one.
    pub fn insert(&self, role: TemplateRole, image: BgrFrame) -> Arc<Template> {
        if let Ok(mut sources) = self.sources.write() {
            sources.remove(&role);
        }
        self.install(role, image, None)
    }

    fn install(&self, role: TemplateRole, image: BgrFrame, modified: Option<SystemTime>) -> Arc<Template> {
        let template = Arc::new(Template {
            role,
            image,
            modified,
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            loaded_at: Utc::now(),
        });
        if let Ok(mut map) = self.templates.write() {
            map.insert(role, Arc::clone(&template));
        }
        template
    }

    /// Current template for `role`, or `None` when it was never loaded.
    pub fn get(&self, role: TemplateRole) -> Option<Arc<Template>> {
        self.templates.read().ok()?.get(&role).cloned()
    }
}
