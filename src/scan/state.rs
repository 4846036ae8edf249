//! Scan bookkeeping shared between the worker and its callers.

use crate::error::AppResult;
use crate::hardware::{Positioner, StagePosition};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Snapshot of the controller state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanState {
    /// Visit index of the point being worked on, or next to be worked on
    pub current_index: usize,
    /// Worker active
    pub running: bool,
    /// A stop was requested and the worker has not exited yet
    pub stop_requested: bool,
    /// Skip the press/measure/retract cycle
    pub dont_test: bool,
}

/// Last successfully read stage position.
///
/// All writers go through [`PositionState::update`], so the value always
/// reflects a real read-back.
#[derive(Debug, Default)]
pub struct PositionState {
    last: RwLock<Option<StagePosition>>,
}

impl PositionState {
    /// No position read yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful read.
    pub fn update(&self, position: StagePosition) {
        if let Ok(mut last) = self.last.write() {
            *last = Some(position);
        }
    }

    /// Last recorded position.
    pub fn get(&self) -> Option<StagePosition> {
        self.last.read().ok().and_then(|p| *p)
    }

    /// Read the positioner and record the result.
    pub async fn refresh(&self, positioner: &dyn Positioner) -> AppResult<StagePosition> {
        let position = positioner.read_position().await?;
        self.update(position);
        Ok(position)
    }
}

/// Stop counter other components (manual jog, a UI button) can raise.
///
/// The scan loop consumes it between points: a raised signal stops the scan
/// and resets the counter.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicU32>);

impl StopSignal {
    /// Fresh, lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running scan to stop before its next point.
    pub fn raise(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether the signal is raised, without consuming it.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }

    /// Consume the signal, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.0.swap(0, Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_take_resets() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!signal.take());
        clone.raise();
        clone.raise();
        assert!(signal.is_raised());
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn test_position_state_update() {
        let state = PositionState::new();
        assert_eq!(state.get(), None);
        let p = StagePosition {
            x: 1.0,
            y: 2.0,
            z: 3.0,
        };
        state.update(p);
        assert_eq!(state.get(), Some(p));
    }
}
