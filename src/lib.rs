//! Core library for automated probe-needle positioning and grid scanning.
//!
//! A scan starts from three calibration anchors. [`grid`] turns them into an
//! ordered plan of device positions and labels, [`vision`] locates the needle
//! and the bond pads in camera frames, and [`scan`] walks the plan on a worker
//! task: coarse move, vision re-centering, and an optional
//! press/measure/retract cycle. Hardware is reached only through the
//! capability traits in [`hardware`], with every positioner command
//! serialized through one [`hardware::HardwareLock`].

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod grid;
pub mod hardware;
pub mod logging;
pub mod monitor;
pub mod scan;
pub mod vision;
