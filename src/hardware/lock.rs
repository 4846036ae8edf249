//! Exclusive access to a shared serial channel.
//!
//! Every byte sent to the positioner goes through one [`HardwareLock`]. The
//! lock is held for a single command write, never
//! across a multi-command sequence or a settle delay, so a stop request from
//! another task can get in between any two commands.
//!
//! The blocking transport runs on tokio's blocking pool; the owned guard is
//! moved into the blocking task and released when the write returns.

use crate::error::{AppResult, ProbeError};
use crate::error_recovery::{retry_with_policy, RetryPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::trace;

/// Blocking byte channel underneath a [`HardwareLock`].
pub trait Transport: Send {
    /// Write the whole buffer and flush it.
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

type TransportGuard = OwnedMutexGuard<Box<dyn Transport>>;

/// Process-scoped lock around one transport.
///
/// Cloning shares the same lock. Construct it once at startup and hand clones
/// to every component that talks to the device.
#[derive(Clone)]
pub struct HardwareLock {
    name: Arc<str>,
    transport: Arc<Mutex<Box<dyn Transport>>>,
    retry: RetryPolicy,
    acquire_timeout: Duration,
}

impl std::fmt::Debug for HardwareLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareLock")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl HardwareLock {
    /// Wrap `transport`. Each write is retried per `retry`; waiting for the
    /// lock longer than `acquire_timeout` fails with
    /// [`ProbeError::LockTimeout`].
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        retry: RetryPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            transport: Arc::new(Mutex::new(transport)),
            retry,
            acquire_timeout,
        }
    }

    /// Channel name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self) -> AppResult<TransportGuard> {
        timeout(self.acquire_timeout, Arc::clone(&self.transport).lock_owned())
            .await
            .map_err(|_| ProbeError::LockTimeout {
                channel: self.name.to_string(),
                timeout_ms: self.acquire_timeout.as_millis() as u64,
            })
    }

    async fn run_locked<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Transport) -> std::io::Result<T> + Send + 'static,
    {
        let mut guard = self.acquire().await?;
        let acquired = Instant::now();
        let result = tokio::task::spawn_blocking(move || op(&mut **guard))
            .await
            .map_err(|e| ProbeError::Instrument(format!("Transport task failed: {}", e)))?;
        trace!(
            channel = %self.name,
            held_us = acquired.elapsed().as_micros() as u64,
            "Hardware lock released"
        );
        result.map_err(ProbeError::from)
    }

    /// Write raw bytes as one locked, retried command.
    pub async fn write_bytes(&self, bytes: &[u8]) -> AppResult<()> {
        let payload: Arc<[u8]> = Arc::from(bytes);
        retry_with_policy(&self.retry, &self.name, |_| {
            let payload = Arc::clone(&payload);
            async move { self.run_locked(move |t| t.write_all(&payload)).await }
        })
        .await
    }

    /// Write an ASCII command as one locked, retried write.
    pub async fn write_command(&self, command: &str) -> AppResult<()> {
        trace!(channel = %self.name, command, "Command");
        self.write_bytes(command.as_bytes()).await
    }
}

#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::Transport;
    use crate::error::{AppResult, ProbeError};
    use serialport::SerialPort;
    use std::io::Write;
    use std::time::Duration;
    use tracing::debug;

    /// [`Transport`] over a `serialport` handle.
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        /// Open `path` at `baud_rate` with the given I/O timeout.
        pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> AppResult<Self> {
            let port = serialport::new(path, baud_rate)
                .timeout(read_timeout)
                .open()
                .map_err(|e| {
                    ProbeError::Instrument(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        path, baud_rate, e
                    ))
                })?;
            debug!(path, baud_rate, "Serial port opened");
            Ok(Self { port })
        }
    }

    impl Transport for SerialTransport {
        fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.port.write_all(bytes)?;
            self.port.flush()
        }
    }
}
