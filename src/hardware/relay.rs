//! LCUS-type USB relay.
//!
//! Frames are four bytes: `A0`, channel, state, checksum (byte sum).

use crate::error::AppResult;
use async_trait::async_trait;
use tracing::debug;

use super::lock::HardwareLock;
use super::Relay;

/// Single-channel relay on its own serial lock.
#[derive(Debug, Clone)]
pub struct LcusRelay {
    lock: HardwareLock,
    channel: u8,
}

impl LcusRelay {
    /// Relay `channel` behind `lock`.
    pub fn new(lock: HardwareLock, channel: u8) -> Self {
        Self { lock, channel }
    }

    /// Command frame for the given state.
    pub fn frame(channel: u8, on: bool) -> [u8; 4] {
        let state = u8::from(on);
        [
            0xA0,
            channel,
            state,
            0xA0u8.wrapping_add(channel).wrapping_add(state),
        ]
    }
}

#[async_trait]
impl Relay for LcusRelay {
    async fn set_relay(&self, on: bool) -> AppResult<()> {
        self.lock.write_bytes(&Self::frame(self.channel, on)).await?;
        debug!(channel = self.channel, on, "Relay switched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames() {
        assert_eq!(LcusRelay::frame(1, false), [0xA0, 0x01, 0x00, 0xA1]);
        assert_eq!(LcusRelay::frame(1, true), [0xA0, 0x01, 0x01, 0xA2]);
    }
}
