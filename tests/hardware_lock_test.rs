//! Serialization of concurrent positioner commands through one lock.

use probe_scan::config::{PositionerConfig, TemperatureMode};
use probe_scan::error::ProbeError;
use probe_scan::error_recovery::RetryPolicy;
use probe_scan::hardware::mock::MockTransport;
use probe_scan::hardware::{Axis, HardwareLock, LcusRelay, Positioner, Relay, ScanningStage};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn shared_lock(transport: &MockTransport) -> HardwareLock {
    HardwareLock::new(
        "stage",
        Box::new(transport.clone()),
        RetryPolicy::new(3, 1),
        Duration::from_secs(10),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commands_never_interleave() {
    let transport = MockTransport::with_byte_delay(Duration::from_micros(200));
    let lock = shared_lock(&transport);

    let mut tasks = Vec::new();
    for caller in 0..8 {
        let lock = lock.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..5 {
                let command = format!("[target:ch{}:{:.6}]", caller, n as f64);
                lock.write_command(&command).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let commands = transport.commands();
    assert_eq!(commands.len(), 40);

    let expected: HashSet<String> = (0..8)
        .flat_map(|caller| (0..5).map(move |n| format!("[target:ch{}:{:.6}]", caller, n as f64)))
        .collect();
    let observed: HashSet<String> = commands.into_iter().collect();
    assert_eq!(observed, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stage_moves_and_relay_frames_share_the_lock() {
    let transport = MockTransport::with_byte_delay(Duration::from_micros(100));
    let lock = shared_lock(&transport);
    let config = PositionerConfig {
        temperature_mode: TemperatureMode::Low,
        motion_dwell_ms: 2,
        ..PositionerConfig::default()
    };
    let stage = Arc::new(ScanningStage::new(lock.clone(), &config));
    let relay = Arc::new(LcusRelay::new(lock, 1));

    let mover = {
        let stage = Arc::clone(&stage);
        tokio::spawn(async move {
            for i in 0..4 {
                stage.move_absolute(Axis::X, f64::from(i)).await.unwrap();
            }
        })
    };
    let switcher = {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            for i in 0..4 {
                relay.set_relay(i % 2 == 0).await.unwrap();
            }
        })
    };
    mover.await.unwrap();
    switcher.await.unwrap();

    // Remove the four relay frames wherever they landed; what is left must be
    // whole bracket commands.
    let mut written = transport.written();
    for on in [true, false] {
        let frame = LcusRelay::frame(1, on);
        for _ in 0..2 {
            let at = written
                .windows(frame.len())
                .position(|w| w == frame)
                .expect("relay frame written contiguously");
            written.drain(at..at + frame.len());
        }
    }
    let text = String::from_utf8(written).unwrap();
    let commands: Vec<&str> = text.split_inclusive(']').collect();
    assert_eq!(commands.len(), 16);
    assert!(commands.iter().all(|c| c.starts_with('[') && c.ends_with(']')));
    assert_eq!(stage.read_position().await.unwrap().x, 3.0);
}

#[tokio::test]
async fn test_stop_between_commands_of_a_move() {
    let transport = MockTransport::new();
    let lock = shared_lock(&transport);
    let config = PositionerConfig {
        motion_dwell_ms: 200,
        ..PositionerConfig::default()
    };
    let stage = Arc::new(ScanningStage::new(lock.clone(), &config));

    let mover = {
        let stage = Arc::clone(&stage);
        tokio::spawn(async move { stage.move_absolute(Axis::Y, 10.0).await })
    };
    // The lock is free during the dwell
    tokio::time::sleep(Duration::from_millis(50)).await;
    lock.write_command("[stop]").await.unwrap();
    mover.await.unwrap().unwrap();

    assert_eq!(
        transport.commands(),
        vec!["[nch:12]", "[start]", "[target:ch2:10.000000]", "[stop]", "[stop]"]
    );
}

#[tokio::test]
async fn test_exhausted_write_is_reported_to_caller() {
    let transport = MockTransport::new();
    transport.fail_on("[nch");
    let stage = ScanningStage::new(shared_lock(&transport), &PositionerConfig::default());
    let err = stage.move_absolute(Axis::X, 1.0).await.unwrap_err();
    assert!(matches!(err, ProbeError::Transport { attempts: 3, .. }));
}
