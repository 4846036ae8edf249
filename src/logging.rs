//! Tracing initialisation.
//!
//! The configured `application.log_level` seeds the filter; `RUST_LOG` takes
//! precedence when set, so `RUST_LOG=probe_scan::scan=debug` narrows output to
//! the scan loop.

use crate::config::ApplicationConfig;
use crate::error::{AppResult, ProbeError};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber from application settings.
///
/// Fails if a global subscriber is already installed.
pub fn init_from_config(app: &ApplicationConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app.log_level))
        .map_err(|e| ProbeError::Configuration(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if app.json_logs {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init()
    };

    result.map_err(|e| ProbeError::Configuration(format!("Tracing already initialised: {}", e)))
}
