//! Scan controller: the worker that walks a [`ScanPlan`].
//!
//! `Idle -> Running -> Idle`. A running scan visits points in plan order from
//! its start index. Per point it moves X and Y, settles, re-centers on the
//! nearest pad and, unless electrical testing is off, runs the
//! press/measure/retract cycle.
//!
//! Cancellation is checked between points only, so a point that has started
//! always finishes its hardware sequence. Every error escaping a point forces a
//! retract before the loop decides whether to skip the point or halt.

use crate::config::{ElectricalConfig, ProbeConfig, ScanConfig};
use crate::error::{AppResult, ProbeError};
use crate::grid::{DevicePoint, ScanPlan};
use crate::hardware::{Axis, Instruments};
use crate::monitor::{MemoryGuard, MemoryPressure};
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use super::events::{PointResult, ScanEvent, SkipReason, StopReason};
use super::measure::{PressCycle, PressOutcome};
use super::recenter::{RecenterOutcome, Recenterer};
use super::state::{PositionState, ScanState, StopSignal};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

enum PointOutcome {
    Completed(PointResult),
    Skipped(SkipReason),
}

struct Shared {
    plan: ScanPlan,
    instruments: Instruments,
    recenterer: Recenterer,
    memory: MemoryGuard,
    scan: ScanConfig,
    electrical: ElectricalConfig,
    state: Mutex<ScanState>,
    cancel: AtomicBool,
    stop_signal: StopSignal,
    positions: Arc<PositionState>,
    events: broadcast::Sender<ScanEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Drives one scan worker at a time over a fixed plan.
pub struct ScanController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("points", &self.shared.plan.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ScanController {
    /// Controller for `plan`. Settle times, heights and electrical settings
    /// come from `config`.
    pub fn new(
        plan: ScanPlan,
        instruments: Instruments,
        recenterer: Recenterer,
        memory: MemoryGuard,
        config: &ProbeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = ScanState {
            dont_test: config.scan.skip_electrical,
            ..ScanState::default()
        };
        Self {
            shared: Arc::new(Shared {
                plan,
                instruments,
                recenterer,
                memory,
                scan: config.scan.clone(),
                electrical: config.electrical.clone(),
                state: Mutex::new(state),
                cancel: AtomicBool::new(false),
                stop_signal: StopSignal::new(),
                positions: Arc::new(PositionState::new()),
                events,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.shared.events.subscribe()
    }

    /// The plan being scanned.
    pub fn plan(&self) -> &ScanPlan {
        &self.shared.plan
    }

    /// Snapshot of the controller state.
    pub fn state(&self) -> ScanState {
        *self.shared.state()
    }

    /// Whether a worker is active.
    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    /// Handle other components raise to stop the scan.
    pub fn stop_signal(&self) -> StopSignal {
        self.shared.stop_signal.clone()
    }

    /// Position bookkeeping shared with displays.
    pub fn positions(&self) -> Arc<PositionState> {
        Arc::clone(&self.shared.positions)
    }

    /// Skip the press/measure/retract cycle on subsequent points.
    pub fn set_dont_test(&self, dont_test: bool) {
        self.shared.state().dont_test = dont_test;
    }

    /// Start from the point nearest the current stage position.
    ///
    /// Returns `Ok(false)` without doing anything if a scan is already running.
    pub async fn start(&self) -> AppResult<bool> {
        if self.is_running() {
            info!("Scan already running; start ignored");
            return Ok(false);
        }

        let shared = &self.shared;
        let here = match shared
            .positions
            .refresh(shared.instruments.positioner.as_ref())
            .await
        {
            Ok(position) => position,
            Err(e) => {
                warn!(error = %e, "Position read failed; using last known position");
                shared.positions.get().ok_or(e)?
            }
        };

        let index = shared.plan.nearest_index(here.xy()).ok_or_else(|| {
            ProbeError::Calibration("Scan plan has no points".to_string())
        })?;
        info!(x = here.x, y = here.y, index, "Resolved nearest start point");
        self.start_from(index)
    }

    /// Start at a given visit index.
    pub fn start_from(&self, index: usize) -> AppResult<bool> {
        let total = self.shared.plan.len();
        if index >= total {
            return Err(ProbeError::Calibration(format!(
                "Start index {} outside plan of {} points",
                index, total
            )));
        }

        {
            let mut state = self.shared.state();
            if state.running {
                info!("Scan already running; start ignored");
                return Ok(false);
            }
            state.running = true;
            state.stop_requested = false;
            state.current_index = index;
        }
        self.shared.cancel.store(false, Ordering::SeqCst);
        // A stop raised while idle does not carry over into the new scan
        self.shared.stop_signal.take();

        let shared = Arc::clone(&self.shared);
        let span = info_span!("scan", start_index = index, total);
        let handle = tokio::spawn(async move { run_scan(shared, index).await }.instrument(span));

        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        *worker = Some(handle);
        Ok(true)
    }

    /// Ask the worker to exit before its next point.
    ///
    /// Returns whether a scan was running.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state();
        if !state.running {
            return false;
        }
        state.stop_requested = true;
        self.shared.cancel.store(true, Ordering::SeqCst);
        info!(index = state.current_index, "Stop requested");
        true
    }

    /// Wait for the current worker, if any, to exit.
    pub async fn wait(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Scan worker task failed");
            }
        }
    }
}

async fn run_scan(shared: Arc<Shared>, start_index: usize) {
    let total = shared.plan.len();
    info!("Scan started");
    shared.emit(ScanEvent::Started { start_index, total });

    let mut index = start_index;
    let reason = loop {
        if shared.cancel.load(Ordering::SeqCst) {
            break StopReason::Requested;
        }
        if shared.stop_signal.take() {
            info!(index, "External stop raised");
            break StopReason::ExternalStop;
        }
        let Some(point) = shared.plan.get(index) else {
            break StopReason::Completed;
        };
        shared.state().current_index = index;

        let outcome = AssertUnwindSafe(run_point(&shared, point))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(PointOutcome::Completed(result))) => {
                shared.emit(ScanEvent::PointResult(result));
            }
            Ok(Ok(PointOutcome::Skipped(reason))) => {
                warn!(index, name = %point.name, %reason, "Point skipped");
                shared.emit(ScanEvent::PointSkipped {
                    index,
                    name: point.name.clone(),
                    reason,
                });
            }
            Ok(Err(e)) if e.is_point_recoverable() => {
                error!(
                    index,
                    x = point.position.x,
                    y = point.position.y,
                    error = %e,
                    "Point failed"
                );
                if let Err(halt) = safe_retract(&shared).await {
                    break StopReason::Halted(halt.to_string());
                }
                shared.emit(ScanEvent::PointSkipped {
                    index,
                    name: point.name.clone(),
                    reason: SkipReason::for_error(&e),
                });
            }
            Ok(Err(e)) => {
                error!(index, error = %e, "Scan halted");
                let _ = safe_retract(&shared).await;
                break StopReason::Halted(e.to_string());
            }
            Err(_) => {
                error!(index, "Point panicked; halting scan");
                let _ = safe_retract(&shared).await;
                break StopReason::Halted(format!("panic while processing point {}", index));
            }
        }
        index += 1;
    };

    let next_index = match reason {
        StopReason::Completed => total,
        _ => index,
    };
    {
        let mut state = shared.state();
        state.running = false;
        state.stop_requested = false;
        state.current_index = next_index.min(total.saturating_sub(1));
    }
    info!(?reason, next_index, "Scan stopped");
    shared.emit(ScanEvent::Stopped { reason, next_index });
}

async fn safe_retract(shared: &Shared) -> AppResult<()> {
    shared
        .instruments
        .positioner
        .move_absolute(Axis::Z, shared.scan.retract_z)
        .await
        .map(|_| ())
        .map_err(|e| {
            error!(error = %e, "Safe retract failed");
            ProbeError::ScanAborted(format!("retract failed: {}", e))
        })
}

async fn run_point(shared: &Shared, point: &DevicePoint) -> AppResult<PointOutcome> {
    let inst = &shared.instruments;
    let scan = &shared.scan;
    info!(
        index = point.visit_index,
        name = %point.name,
        x = point.position.x,
        y = point.position.y,
        "Moving to point"
    );

    inst.positioner
        .move_absolute(Axis::X, point.position.x)
        .await?;
    inst.positioner
        .move_absolute(Axis::Y, point.position.y)
        .await?;
    sleep(scan.settle()).await;

    let pressure = shared.memory.check();
    let matched = if let MemoryPressure::Exceeded { resident_mb } = pressure {
        let purged = shared.recenterer.matcher().purge_cache();
        warn!(
            resident_mb,
            ceiling_mb = shared.memory.ceiling_mb(),
            purged,
            "Memory ceiling exceeded; using planned coordinates"
        );
        sleep(scan.pressure_settle()).await;
        false
    } else {
        match shared.recenterer.recenter(inst, &shared.positions).await? {
            RecenterOutcome::Corrected { .. } => true,
            RecenterOutcome::NeedleNotFound { best_score } => {
                return Ok(PointOutcome::Skipped(SkipReason::NeedleNotFound {
                    best_score,
                }))
            }
            RecenterOutcome::NoPads => return Ok(PointOutcome::Skipped(SkipReason::NoPads)),
        }
    };

    let here = shared.positions.refresh(inst.positioner.as_ref()).await?;
    sleep(scan.post_move_settle()).await;

    let dont_test = shared.state().dont_test;
    let (contacted, current, iv_curve) = if dont_test {
        (false, None, Vec::new())
    } else {
        let cycle = PressCycle {
            instruments: inst,
            recenterer: &shared.recenterer,
            positions: &shared.positions,
            scan,
            electrical: &shared.electrical,
            recenter_when_pressed: !pressure.is_exceeded(),
        };
        match cycle.run().await? {
            PressOutcome::Measured(m) => (m.contacted, Some(m.current), m.iv_curve),
            PressOutcome::NeedleLost { best_score } => {
                return Ok(PointOutcome::Skipped(SkipReason::NeedleLostAfterPress {
                    best_score,
                }))
            }
            PressOutcome::NoPads => return Ok(PointOutcome::Skipped(SkipReason::NoPads)),
        }
    };

    let position = shared
        .positions
        .get()
        .map(|p| p.xy())
        .unwrap_or(here.xy());
    info!(
        index = point.visit_index,
        name = %point.name,
        matched,
        contacted,
        current,
        "Point complete"
    );
    Ok(PointOutcome::Completed(PointResult {
        index: point.visit_index,
        name: point.name.clone(),
        position,
        matched,
        contacted,
        current,
        iv_curve,
        timestamp: Utc::now(),
    }))
}
