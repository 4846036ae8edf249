//! Grid planning: stage coordinates and device labels for every device on the
//! chip, in serpentine visiting order.
//!
//! [`ScanPlan::from_anchors`] is the usual entry point. It runs [`plan_grid`]
//! and [`plan_names`] and zips the results index by index.

pub mod names;
pub mod planner;

pub use names::plan_names;
pub use planner::{
    nearest_index, plan_grid, CalibrationAnchor, DevicePoint, GridAnchors, GridCell, StagePoint,
};

use crate::error::AppResult;
use serde::Serialize;
use tracing::info;

/// An immutable, ordered device sequence for one scan setup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPlan {
    rows: u32,
    cols: u32,
    points: Vec<DevicePoint>,
}

impl ScanPlan {
    /// Plan positions and labels from three anchors.
    pub fn from_anchors(anchors: &GridAnchors, rows: u32, cols: u32) -> AppResult<Self> {
        let cells = plan_grid(anchors, rows, cols)?;
        let names = plan_names(
            anchors.top_left.name.as_deref(),
            anchors.top_right.name.as_deref(),
            anchors.bottom_right.name.as_deref(),
            rows,
            cols,
        );

        let points: Vec<DevicePoint> = cells
            .into_iter()
            .zip(names)
            .map(|(cell, name)| DevicePoint {
                position: cell.position,
                name,
                visit_index: cell.visit_index,
                row: cell.row,
                column: cell.column,
            })
            .collect();

        info!(rows, cols, devices = points.len(), "Scan plan ready");
        Ok(Self { rows, cols, points })
    }

    /// Number of rows.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> u32 {
        self.cols
    }

    /// Devices in visiting order.
    pub fn points(&self) -> &[DevicePoint] {
        &self.points
    }

    /// Device at `index` in visiting order.
    pub fn get(&self, index: usize) -> Option<&DevicePoint> {
        self.points.get(index)
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the plan is empty. Never true for a plan built from anchors.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Visit index of the device nearest `at`.
    pub fn nearest_index(&self, at: StagePoint) -> Option<usize> {
        nearest_index(self.points.iter().map(|p| &p.position), at)
    }
}
