//! Scan controller behaviour against simulated hardware.

use probe_scan::config::{ProbeConfig, TemplatePaths};
use probe_scan::grid::{CalibrationAnchor, GridAnchors, ScanPlan};
use probe_scan::hardware::mock::{
    noise_patch, MockFrameSource, MockPositioner, MockRelay, MockSourceMeter, MockTransport,
    SyntheticScene,
};
use probe_scan::error_recovery::RetryPolicy;
use probe_scan::hardware::{
    Axis, HardwareLock, Instruments, Positioner, ScanningStage, StagePosition,
};
use probe_scan::monitor::{FixedSampler, MemoryGuard};
use probe_scan::scan::{
    PointResult, Recenterer, ScanController, ScanEvent, SkipReason, StopReason,
};
use probe_scan::vision::{BgrFrame, TemplateMatcher, TemplateRole, TemplateStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

struct Rig {
    positioner: Arc<MockPositioner>,
    meter: Arc<MockSourceMeter>,
    relay: Arc<MockRelay>,
    camera: Arc<MockFrameSource>,
    matcher: Arc<TemplateMatcher>,
    controller: ScanController,
    _dir: TempDir,
}

fn fast_config() -> ProbeConfig {
    let mut config = ProbeConfig::default();
    config.scan.settle_ms = 1;
    config.scan.post_move_settle_ms = 1;
    config.scan.pressure_settle_ms = 1;
    config.scan.contact_z = 0.0;
    config.scan.retract_z = 1.0;
    config.electrical.relay_settle_ms = 1;
    config
}

/// 2 rows x 3 columns, pitch 10. Visiting order:
/// (0,0) (0,10) (10,10) (10,0) (20,0) (20,10)
fn plan() -> ScanPlan {
    let anchors = GridAnchors {
        top_left: CalibrationAnchor::new(0.0, 0.0, 1, 1).with_name("AA_1"),
        top_right: CalibrationAnchor::new(20.0, 0.0, 1, 3),
        bottom_right: CalibrationAnchor::new(20.0, 10.0, 2, 3),
    };
    ScanPlan::from_anchors(&anchors, 2, 3).unwrap()
}

fn rig(config: &ProbeConfig, resident_mb: u64, current: f64, move_delay: Duration) -> Rig {
    let dir = TempDir::new().unwrap();
    let scene = SyntheticScene::default();
    let store = Arc::new(TemplateStore::new());
    store.insert(TemplateRole::Needle, scene.needle.clone());
    store.insert(TemplateRole::Pad, scene.pad.clone());
    let matcher = TemplateMatcher::new(store, dir.path().join("bias.txt"));
    rig_with(config, matcher, dir, resident_mb, current, move_delay)
}

fn rig_with(
    config: &ProbeConfig,
    matcher: TemplateMatcher,
    dir: TempDir,
    resident_mb: u64,
    current: f64,
    move_delay: Duration,
) -> Rig {
    let scene = SyntheticScene::default();
    let matcher = Arc::new(matcher);

    let positioner = Arc::new(MockPositioner::with_move_delay(move_delay));
    let meter = Arc::new(MockSourceMeter::new(current));
    let relay = Arc::new(MockRelay::new());
    let camera = Arc::new(MockFrameSource::new(scene.frame));
    let instruments = Instruments {
        positioner: positioner.clone(),
        meter: meter.clone(),
        relay: relay.clone(),
        camera: camera.clone(),
    };

    let memory = MemoryGuard::new(
        Box::new(FixedSampler::from_mb(resident_mb)),
        config.scan.memory_ceiling_mb,
    );
    let recenterer = Recenterer::new(Arc::clone(&matcher), &config.vision);
    let controller = ScanController::new(plan(), instruments, recenterer, memory, config);

    Rig {
        positioner,
        meter,
        relay,
        camera,
        matcher,
        controller,
        _dir: dir,
    }
}

async fn next_event(events: &mut broadcast::Receiver<ScanEvent>) -> ScanEvent {
    timeout(Duration::from_secs(20), events.recv())
        .await
        .expect("scan event within timeout")
        .expect("event channel open")
}

async fn until_stopped(events: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(event, ScanEvent::Stopped { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn results(events: &[ScanEvent]) -> Vec<&PointResult> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::PointResult(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn skips(events: &[ScanEvent]) -> Vec<(usize, &SkipReason)> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::PointSkipped { index, reason, .. } => Some((*index, reason)),
            _ => None,
        })
        .collect()
}

fn stop_of(events: &[ScanEvent]) -> (StopReason, usize) {
    match events.last() {
        Some(ScanEvent::Stopped { reason, next_index }) => (reason.clone(), *next_index),
        other => panic!("expected Stopped, got {:?}", other),
    }
}

#[tokio::test]
async fn test_full_scan_measures_every_point() {
    let mut config = fast_config();
    config.electrical.iv_sweep_volts = vec![-0.1, 0.0, 0.1];
    let rig = rig(&config, 100, 2e-9, Duration::ZERO);
    let mut events = rig.controller.subscribe();

    assert!(rig.controller.start_from(0).unwrap());
    let seen = until_stopped(&mut events).await;
    rig.controller.wait().await;

    assert!(matches!(
        seen.first(),
        Some(ScanEvent::Started {
            start_index: 0,
            total: 6
        })
    ));
    let points = results(&seen);
    assert_eq!(
        points.iter().map(|r| r.index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4, 5]
    );
    assert_eq!(
        points.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        vec!["AA_1", "ZA_2", "ZB_2", "AB_1", "AC_1", "ZC_2"]
    );
    for r in &points {
        assert!(r.matched);
        assert!(r.contacted);
        assert_eq!(r.current, Some(2e-9));
        assert_eq!(r.iv_curve.len(), 3);
    }
    assert_eq!(stop_of(&seen), (StopReason::Completed, 6));

    // Relay released for each sweep and put back afterwards
    assert_eq!(rig.relay.history().await, [false, true].repeat(6));
    // Two re-centerings per point
    assert_eq!(rig.camera.frame_count(), 12);
    // Needle ends retracted
    assert_eq!(rig.positioner.read_position().await.unwrap().z, 1.0);
    assert!(!rig.controller.is_running());
}

#[tokio::test]
async fn test_current_at_threshold_is_not_contact() {
    let config = fast_config();
    let rig = rig(&config, 100, 9e-10, Duration::ZERO);
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(4).unwrap();
    let seen = until_stopped(&mut events).await;

    let points = results(&seen);
    assert_eq!(points.len(), 2);
    assert!(points.iter().all(|r| !r.contacted && r.iv_curve.is_empty()));
    assert!(rig.relay.history().await.is_empty());
    assert_eq!(rig.meter.compliance().await, Some(config.electrical.compliance_current));
}

#[tokio::test]
async fn test_start_while_running_is_a_noop() {
    let config = fast_config();
    let rig = rig(&config, 100, 2e-9, Duration::from_millis(20));

    assert!(rig.controller.start_from(0).unwrap());
    assert!(!rig.controller.start_from(3).unwrap());
    assert!(!rig.controller.start().await.unwrap());
    assert!(rig.controller.stop());
    rig.controller.wait().await;
    assert!(!rig.controller.stop());
    assert!(rig.controller.start_from(6).is_err());
}

#[tokio::test]
async fn test_resume_starts_at_point_nearest_new_position() {
    let mut config = fast_config();
    config.scan.skip_electrical = true;
    let rig = rig(&config, 100, 2e-9, Duration::from_millis(10));
    let mut events = rig.controller.subscribe();

    assert!(rig.controller.start_from(0).unwrap());
    loop {
        if let ScanEvent::PointResult(r) = next_event(&mut events).await {
            assert_eq!(r.index, 0);
            break;
        }
    }
    assert!(rig.controller.stop());
    let seen = until_stopped(&mut events).await;
    rig.controller.wait().await;
    let (reason, interrupted_at) = stop_of(&seen);
    assert_eq!(reason, StopReason::Requested);
    assert!(interrupted_at <= 2, "stopped late at {}", interrupted_at);

    // Someone jogs the stage next to visit index 4, at (20, 0)
    rig.positioner
        .set_position(StagePosition {
            x: 19.2,
            y: 0.7,
            z: 1.0,
        })
        .await;

    assert!(rig.controller.start().await.unwrap());
    let seen = until_stopped(&mut events).await;
    assert!(matches!(
        seen.first(),
        Some(ScanEvent::Started { start_index: 4, .. })
    ));
    assert_eq!(
        results(&seen).iter().map(|r| r.index).collect::<Vec<_>>(),
        vec![4, 5]
    );
    assert_eq!(stop_of(&seen), (StopReason::Completed, 6));
}

#[tokio::test]
async fn test_needle_not_found_skips_without_pressing() {
    let config = fast_config();
    let rig = rig(&config, 100, 2e-9, Duration::ZERO);
    rig.camera
        .set_frames(vec![BgrFrame::filled(160, 120, [96, 96, 96])])
        .await;
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(3).unwrap();
    let seen = until_stopped(&mut events).await;

    let skipped = skips(&seen);
    assert_eq!(skipped.len(), 3);
    assert!(skipped
        .iter()
        .all(|(_, r)| matches!(r, SkipReason::NeedleNotFound { .. })));
    assert!(results(&seen).is_empty());
    assert!(!rig
        .positioner
        .moves()
        .await
        .iter()
        .any(|(axis, _)| *axis == Axis::Z));
    assert_eq!(stop_of(&seen), (StopReason::Completed, 6));
}

#[tokio::test]
async fn test_memory_pressure_uses_planned_coordinates() {
    let config = fast_config();
    let rig = rig(&config, 700, 2e-9, Duration::ZERO);
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(0).unwrap();
    let seen = until_stopped(&mut events).await;

    let points = results(&seen);
    assert_eq!(points.len(), 6);
    assert!(points.iter().all(|r| !r.matched && r.contacted));
    assert_eq!(rig.camera.frame_count(), 0);
    assert_eq!(points[2].position.x, 10.0);
    assert_eq!(points[2].position.y, 10.0);
    assert_eq!(rig.matcher.cached_templates(), 0);
}

#[tokio::test]
async fn test_retract_failure_halts_scan() {
    let config = fast_config();
    let rig = rig(&config, 100, 2e-9, Duration::ZERO);
    rig.positioner.set_failing_axis(Some(Axis::Z)).await;
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(2).unwrap();
    let seen = until_stopped(&mut events).await;
    rig.controller.wait().await;

    let (reason, next_index) = stop_of(&seen);
    assert!(matches!(reason, StopReason::Halted(ref why) if why.contains("retract")));
    assert_eq!(next_index, 2);
    assert!(results(&seen).is_empty());
    assert!(!rig.controller.is_running());
}

#[tokio::test]
async fn test_transport_failure_skips_point_and_continues() {
    let config = fast_config();
    let rig = rig(&config, 100, 2e-9, Duration::ZERO);
    rig.positioner.set_failing_axis(Some(Axis::X)).await;
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(0).unwrap();
    let seen = until_stopped(&mut events).await;

    let skipped = skips(&seen);
    assert_eq!(
        skipped.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4, 5]
    );
    assert!(skipped
        .iter()
        .all(|(_, r)| matches!(r, SkipReason::Transport { .. })));
    assert_eq!(stop_of(&seen), (StopReason::Completed, 6));
    // Each failure was followed by a safe retract
    let z_moves = rig
        .positioner
        .moves()
        .await
        .into_iter()
        .filter(|(axis, z)| *axis == Axis::Z && *z == 1.0)
        .count();
    assert_eq!(z_moves, 6);
}

#[tokio::test]
async fn test_external_stop_signal_is_consumed() {
    let config = fast_config();
    let rig = rig(&config, 100, 2e-9, Duration::from_millis(10));
    let signal = rig.controller.stop_signal();
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(0).unwrap();
    signal.raise();
    let seen = until_stopped(&mut events).await;

    let (reason, next_index) = stop_of(&seen);
    assert_eq!(reason, StopReason::ExternalStop);
    assert!(next_index < 6);
    assert!(!signal.is_raised());
}

#[tokio::test]
async fn test_dont_test_skips_electrical_cycle() {
    let config = fast_config();
    let rig = rig(&config, 100, 2e-9, Duration::ZERO);
    rig.controller.set_dont_test(true);
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(0).unwrap();
    let seen = until_stopped(&mut events).await;

    let points = results(&seen);
    assert_eq!(points.len(), 6);
    assert!(points.iter().all(|r| r.matched && r.current.is_none()));
    assert_eq!(rig.meter.read_count(), 0);
    assert!(rig.controller.state().dont_test);
}

fn template_paths(dir: &TempDir) -> TemplatePaths {
    TemplatePaths {
        needle: dir.path().join("needle.png"),
        pad: dir.path().join("pad.png"),
        light: dir.path().join("light.png"),
    }
}

#[tokio::test]
async fn test_pad_template_replaced_on_disk_between_points() {
    let config = fast_config();
    let dir = TempDir::new().unwrap();
    let scene = SyntheticScene::default();
    let paths = template_paths(&dir);
    scene.needle.save(&paths.needle).unwrap();
    scene.pad.save(&paths.pad).unwrap();

    let store = Arc::new(TemplateStore::new());
    let matcher = TemplateMatcher::new(Arc::clone(&store), dir.path().join("bias.txt"))
        .with_sources(paths.clone());
    let rig = rig_with(&config, matcher, dir, 100, 2e-9, Duration::from_millis(50));
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(0).unwrap();
    loop {
        match next_event(&mut events).await {
            ScanEvent::Started { .. } => {}
            ScanEvent::PointResult(r) => {
                assert_eq!(r.index, 0);
                assert!(r.matched);
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    // Loaded from disk by the first re-centering
    let first = store.get(TemplateRole::Pad).unwrap();
    assert_eq!((first.width(), first.height()), (24, 24));

    noise_patch(30, 30, 99).save(&paths.pad).unwrap();
    let later = first.modified.unwrap() + Duration::from_secs(60);
    std::fs::File::options()
        .write(true)
        .open(&paths.pad)
        .unwrap()
        .set_modified(later)
        .unwrap();

    let seen = until_stopped(&mut events).await;
    rig.controller.wait().await;

    let served = store.get(TemplateRole::Pad).unwrap();
    assert_eq!((served.width(), served.height()), (30, 30));
    assert!(served.generation > first.generation);

    // The replacement pattern does not occur in the synthetic frame
    let skipped = skips(&seen);
    assert_eq!(skipped.len(), 5);
    assert!(skipped.iter().all(|(_, r)| matches!(r, SkipReason::NoPads)));
    assert_eq!(stop_of(&seen), (StopReason::Completed, 6));
}

#[tokio::test]
async fn test_missing_template_skips_as_vision_failure() {
    let config = fast_config();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TemplateStore::new());
    store.insert(TemplateRole::Pad, SyntheticScene::default().pad);
    let matcher = TemplateMatcher::new(store, dir.path().join("bias.txt"));
    let rig = rig_with(&config, matcher, dir, 100, 2e-9, Duration::ZERO);
    let mut events = rig.controller.subscribe();

    rig.controller.start_from(4).unwrap();
    let seen = until_stopped(&mut events).await;

    let skipped = skips(&seen);
    assert_eq!(skipped.len(), 2);
    assert!(skipped
        .iter()
        .all(|(_, r)| matches!(r, SkipReason::Vision { message } if message.contains("needle"))));
    assert!(results(&seen).is_empty());
    assert_eq!(stop_of(&seen), (StopReason::Completed, 6));
}

#[tokio::test]
async fn test_resume_sees_jog_through_shared_stage() {
    let mut config = fast_config();
    config.positioner.motion_dwell_ms = 1;
    let lock = HardwareLock::new(
        "stage",
        Box::new(MockTransport::new()),
        RetryPolicy::new(1, 1),
        Duration::from_secs(1),
    );
    let stage = ScanningStage::new(lock, &config.positioner);
    let jog = stage.clone();

    let scene = SyntheticScene::default();
    let store = Arc::new(TemplateStore::new());
    store.insert(TemplateRole::Needle, scene.needle.clone());
    store.insert(TemplateRole::Pad, scene.pad.clone());
    let dir = TempDir::new().unwrap();
    let matcher = Arc::new(TemplateMatcher::new(store, dir.path().join("bias.txt")));
    let instruments = Instruments {
        positioner: Arc::new(stage),
        meter: Arc::new(MockSourceMeter::new(2e-9)),
        relay: Arc::new(MockRelay::new()),
        camera: Arc::new(MockFrameSource::new(scene.frame)),
    };
    let memory = MemoryGuard::new(Box::new(FixedSampler::from_mb(100)), 600);
    let recenterer = Recenterer::new(matcher, &config.vision);
    let controller = ScanController::new(plan(), instruments, recenterer, memory, &config);

    jog.move_absolute(Axis::X, 19.0).await.unwrap();
    jog.move_absolute(Axis::Y, 9.0).await.unwrap();

    let mut events = controller.subscribe();
    assert!(controller.start().await.unwrap());
    assert!(matches!(
        next_event(&mut events).await,
        ScanEvent::Started {
            start_index: 5,
            total: 6
        }
    ));
    controller.stop();
    controller.wait().await;
}
