//! Mock Hardware Implementations
//!
//! Simulated collaborators for tests and the `simulate` command. All delays
//! use `tokio::time::sleep`, except inside [`MockTransport`], which runs on the
//! blocking pool like a real serial port.
//!
//! # Available Mocks
//!
//! - `MockTransport` - byte channel that records what was written
//! - `MockPositioner` - three-axis positioner with move log and fault injection
//! - `MockSourceMeter` - voltage source returning a configurable current
//! - `MockRelay` - relay that records every switch
//! - `MockFrameSource` - camera cycling through fixed frames
//! - `SyntheticScene` - needle and pad frame with matching templates

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{AppResult, ProbeError};
use crate::vision::BgrFrame;

use super::lock::Transport;
use super::{Axis, FrameSource, Positioner, Relay, SourceMeter, StagePosition};

// =============================================================================
// MockTransport - Simulated serial channel
// =============================================================================

#[derive(Debug, Default)]
struct TransportState {
    written: Vec<u8>,
    fail_next: u32,
    fail_prefix: Option<Vec<u8>>,
}

/// Recording byte channel.
///
/// Clones share the same log. With a byte delay, every byte is appended
/// separately, so two unsynchronised writers would interleave in the log.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
    byte_delay: Duration,
}

impl MockTransport {
    /// Transport without delays.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that sleeps after every byte.
    pub fn with_byte_delay(byte_delay: Duration) -> Self {
        Self {
            byte_delay,
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TransportState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail the next `n` writes.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Fail every write starting with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        self.state().fail_prefix = Some(prefix.as_bytes().to_vec());
    }

    /// Every byte written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    /// Written bytes split into bracket commands, each ending at `]`.
    pub fn commands(&self) -> Vec<String> {
        let written = self.written();
        written
            .split_inclusive(|&b| b == b']')
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }
}

impl Transport for MockTransport {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        {
            let mut state = self.state();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "injected write failure",
                ));
            }
            if let Some(prefix) = &state.fail_prefix {
                if bytes.starts_with(prefix) {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "injected write failure",
                    ));
                }
            }
        }

        for &b in bytes {
            self.state().written.push(b);
            if !self.byte_delay.is_zero() {
                std::thread::sleep(self.byte_delay);
            }
        }
        Ok(())
    }
}

// =============================================================================
// MockPositioner - Simulated three-axis positioner
// =============================================================================

/// Positioner that jumps straight to each target after an optional delay.
#[derive(Debug, Default)]
pub struct MockPositioner {
    position: RwLock<StagePosition>,
    moves: RwLock<Vec<(Axis, f64)>>,
    failing_axis: RwLock<Option<Axis>>,
    move_delay: Duration,
}

impl MockPositioner {
    /// Positioner at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Positioner that takes `move_delay` per move.
    pub fn with_move_delay(move_delay: Duration) -> Self {
        Self {
            move_delay,
            ..Self::default()
        }
    }

    /// Teleport, as if someone jogged the stage by hand.
    pub async fn set_position(&self, position: StagePosition) {
        *self.position.write().await = position;
    }

    /// Make every move on `axis` fail, or clear the fault with `None`.
    pub async fn set_failing_axis(&self, axis: Option<Axis>) {
        *self.failing_axis.write().await = axis;
    }

    /// Every successful move so far.
    pub async fn moves(&self) -> Vec<(Axis, f64)> {
        self.moves.read().await.clone()
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    async fn move_absolute(&self, axis: Axis, target: f64) -> AppResult<f64> {
        if *self.failing_axis.read().await == Some(axis) {
            return Err(ProbeError::Transport {
                attempts: 3,
                reason: format!("injected failure on axis {}", axis),
            });
        }
        if !self.move_delay.is_zero() {
            sleep(self.move_delay).await;
        }
        let mut position = self.position.write().await;
        *position = position.with_axis(axis, target);
        self.moves.write().await.push((axis, target));
        debug!(%axis, target, "MockPositioner moved");
        Ok(target)
    }

    async fn read_position(&self) -> AppResult<StagePosition> {
        Ok(*self.position.read().await)
    }
}

// =============================================================================
// MockSourceMeter - Simulated source-measure unit
// =============================================================================

/// Source meter returning a fixed current.
#[derive(Debug, Default)]
pub struct MockSourceMeter {
    current: RwLock<f64>,
    applied: RwLock<Vec<f64>>,
    compliance: RwLock<Option<f64>>,
    reads: AtomicU64,
}

impl MockSourceMeter {
    /// Meter reading `current` amps.
    pub fn new(current: f64) -> Self {
        Self {
            current: RwLock::new(current),
            ..Self::default()
        }
    }

    /// Change the reading.
    pub async fn set_current(&self, current: f64) {
        *self.current.write().await = current;
    }

    /// Voltages applied so far.
    pub async fn applied_voltages(&self) -> Vec<f64> {
        self.applied.read().await.clone()
    }

    /// Last compliance setting.
    pub async fn compliance(&self) -> Option<f64> {
        *self.compliance.read().await
    }

    /// Number of current reads.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    async fn set_compliance(&self, amps: f64) -> AppResult<()> {
        *self.compliance.write().await = Some(amps);
        Ok(())
    }

    async fn apply_voltage(&self, volts: f64) -> AppResult<()> {
        self.applied.write().await.push(volts);
        Ok(())
    }

    async fn read_current(&self) -> AppResult<f64> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(*self.current.read().await)
    }
}

// =============================================================================
// MockRelay - Simulated relay
// =============================================================================

/// Relay that records its switch history.
#[derive(Debug, Default)]
pub struct MockRelay {
    history: RwLock<Vec<bool>>,
}

impl MockRelay {
    /// Relay with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state set so far.
    pub async fn history(&self) -> Vec<bool> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl Relay for MockRelay {
    async fn set_relay(&self, on: bool) -> AppResult<()> {
        self.history.write().await.push(on);
        Ok(())
    }
}

// =============================================================================
// MockFrameSource - Simulated camera
// =============================================================================

/// Camera cycling through a fixed list of frames.
#[derive(Debug)]
pub struct MockFrameSource {
    frames: RwLock<Vec<BgrFrame>>,
    captured: AtomicU64,
}

impl MockFrameSource {
    /// Camera that always returns `frame`.
    pub fn new(frame: BgrFrame) -> Self {
        Self::with_sequence(vec![frame])
    }

    /// Camera returning `frames` in order, wrapping around.
    pub fn with_sequence(frames: Vec<BgrFrame>) -> Self {
        Self {
            frames: RwLock::new(frames),
            captured: AtomicU64::new(0),
        }
    }

    /// Replace the frame list.
    pub async fn set_frames(&self, frames: Vec<BgrFrame>) {
        *self.frames.write().await = frames;
    }

    /// Number of frames captured.
    pub fn frame_count(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSource for MockFrameSource {
    async fn capture_frame(&self) -> AppResult<BgrFrame> {
        let n = self.captured.fetch_add(1, Ordering::Relaxed);
        let frames = self.frames.read().await;
        if frames.is_empty() {
            return Err(ProbeError::Instrument("camera has no frames".to_string()));
        }
        Ok(frames[(n % frames.len() as u64) as usize].clone())
    }
}

// =============================================================================
// SyntheticScene - Camera image with one needle and one pad
// =============================================================================

/// Deterministic noise patch. Different seeds give uncorrelated patches.
pub fn noise_patch(width: u32, height: u32, seed: u32) -> BgrFrame {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (state >> 16) as u8
    };
    let mut patch = BgrFrame::filled(width, height, [0, 0, 0]);
    for y in 0..height {
        for x in 0..width {
            patch.put_pixel(x, y, [next(), next(), next()]);
        }
    }
    patch
}

/// A flat camera frame holding one needle patch and one pad patch, plus the
/// templates that find them.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    /// Camera frame
    pub frame: BgrFrame,
    /// Needle template
    pub needle: BgrFrame,
    /// Pad template
    pub pad: BgrFrame,
}

impl SyntheticScene {
    /// Frame size
    pub const SIZE: (u32, u32) = (160, 120);
    /// Needle template side
    pub const NEEDLE_SIDE: u32 = 16;
    /// Pad template side
    pub const PAD_SIDE: u32 = 24;

    /// Scene with the needle and pad top-left corners at the given pixels.
    pub fn new(needle_at: (u32, u32), pad_at: (u32, u32)) -> Self {
        let needle = noise_patch(Self::NEEDLE_SIDE, Self::NEEDLE_SIDE, 7);
        let pad = noise_patch(Self::PAD_SIDE, Self::PAD_SIDE, 1_234);
        let mut frame = BgrFrame::filled(Self::SIZE.0, Self::SIZE.1, [96, 96, 96]);
        frame.blit(&needle, needle_at.0, needle_at.1);
        frame.blit(&pad, pad_at.0, pad_at.1);
        Self { frame, needle, pad }
    }
}

impl Default for SyntheticScene {
    /// Needle up and to the left of the pad, both fully in view.
    fn default() -> Self {
        Self::new((60, 40), (90, 60))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
