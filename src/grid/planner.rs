//! Device coordinates from three calibration anchors.

use crate::error::{AppResult, ProbeError};
use serde::{Deserialize, Serialize};

/// A position in stage units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePoint {
    /// Stage X
    pub x: f64,
    /// Stage Y
    pub y: f64,
}

impl StagePoint {
    /// Point at (x, y).
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to `other`.
    pub fn distance_sq(&self, other: &StagePoint) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// A known stage position tied to a 1-based grid cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationAnchor {
    /// Stage position of the device at this cell
    pub screen_position: StagePoint,
    /// 1-based row
    pub grid_row: u32,
    /// 1-based column
    pub grid_col: u32,
    /// Optional device label such as `AA_1`
    #[serde(default)]
    pub name: Option<String>,
}

impl CalibrationAnchor {
    /// Unnamed anchor.
    pub fn new(x: f64, y: f64, grid_row: u32, grid_col: u32) -> Self {
        Self {
            screen_position: StagePoint::new(x, y),
            grid_row,
            grid_col,
            name: None,
        }
    }

    /// Attach a device label.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// The three anchors of one scan setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAnchors {
    /// Top-left anchor
    pub top_left: CalibrationAnchor,
    /// Top-right anchor
    pub top_right: CalibrationAnchor,
    /// Bottom-right anchor
    pub bottom_right: CalibrationAnchor,
}

/// A planned device position in visiting order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePoint {
    /// Stage position
    pub position: StagePoint,
    /// Device label
    pub name: String,
    /// Position in the visiting sequence
    pub visit_index: usize,
    /// 0-based row from the top
    pub row: u32,
    /// 0-based visiting column; column 0 holds the top-left anchor and is the
    /// physically rightmost column on the inverted stage X axis
    pub column: u32,
}

/// A planned position without a label, as produced by [`plan_grid`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCell {
    /// Stage position
    pub position: StagePoint,
    /// Position in the visiting sequence
    pub visit_index: usize,
    /// 0-based row from the top
    pub row: u32,
    /// 0-based visiting column
    pub column: u32,
}

fn linspace(start: f64, stop: f64, n: u32) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

fn validate(anchors: &GridAnchors, rows: u32, cols: u32) -> AppResult<()> {
    if rows == 0 || cols == 0 {
        return Err(ProbeError::Calibration(format!(
            "grid must have at least one row and column, got {}x{}",
            rows, cols
        )));
    }

    for (label, anchor) in [
        ("top-left", &anchors.top_left),
        ("top-right", &anchors.top_right),
        ("bottom-right", &anchors.bottom_right),
    ] {
        if !(1..=rows).contains(&anchor.grid_row) || !(1..=cols).contains(&anchor.grid_col) {
            return Err(ProbeError::Calibration(format!(
                "{} anchor cell ({}, {}) lies outside the {}x{} grid",
                label, anchor.grid_row, anchor.grid_col, rows, cols
            )));
        }
        if !anchor.screen_position.is_finite() {
            return Err(ProbeError::Calibration(format!(
                "{} anchor position is not finite",
                label
            )));
        }
    }

    // A single row or column is a line by construction
    if rows > 1 && cols > 1 {
        let a = anchors.top_left.screen_position;
        let b = anchors.top_right.screen_position;
        let c = anchors.bottom_right.screen_position;
        let (ux, uy) = (b.x - a.x, b.y - a.y);
        let (vx, vy) = (c.x - b.x, c.y - b.y);
        let cross = ux * vy - uy * vx;
        let scale = (ux.hypot(uy) * vx.hypot(vy)).max(f64::MIN_POSITIVE);
        if cross.abs() <= 1e-9 * scale {
            return Err(ProbeError::Calibration(
                "calibration anchors are colinear".to_string(),
            ));
        }
    }
    Ok(())
}

/// Plan every device position in serpentine visiting order.
///
/// Spacing comes from the anchor pairs: `dx` from top-left to top-right,
/// `dy` from top-right to bottom-right, zero when the cells coincide. Anchors
/// may be interior cells; the outer corners are extrapolated. Visiting
/// column 0 is traversed top to bottom, column 1 bottom to top, and so on.
pub fn plan_grid(anchors: &GridAnchors, rows: u32, cols: u32) -> AppResult<Vec<GridCell>> {
    validate(anchors, rows, cols)?;

    let tl = anchors.top_left.screen_position;
    let tr = anchors.top_right.screen_position;
    let br = anchors.bottom_right.screen_position;
    let (tl_row, tl_col) = (anchors.top_left.grid_row - 1, anchors.top_left.grid_col - 1);
    let (tr_row, tr_col) = (anchors.top_right.grid_row - 1, anchors.top_right.grid_col - 1);
    let br_row = anchors.bottom_right.grid_row - 1;

    let dx = if tr_col != tl_col {
        (tr.x - tl.x) / (tr_col as f64 - tl_col as f64)
    } else {
        0.0
    };
    let dy = if br_row != tr_row {
        (br.y - tr.y) / (br_row as f64 - tr_row as f64)
    } else {
        0.0
    };

    let outer_left = StagePoint::new(tl.x - dx * tl_col as f64, tl.y - dy * tl_row as f64);
    let outer_right_x = tr.x + dx * (cols - 1 - tr_col) as f64;
    let outer_bottom_y = br.y + dy * (rows - 1 - br_row) as f64;

    // Stage X is inverted: grid index 0 is the outer right corner
    let xs = linspace(outer_right_x, outer_left.x, cols);
    let ys = linspace(outer_left.y, outer_bottom_y, rows);

    let mut cells = Vec::with_capacity(rows as usize * cols as usize);
    for column in 0..cols {
        let x = xs[(cols - 1 - column) as usize];
        let mut push = |row: u32| {
            let visit_index = cells.len();
            cells.push(GridCell {
                position: StagePoint::new(x, ys[row as usize]),
                visit_index,
                row,
                column,
            });
        };
        if column % 2 == 0 {
            (0..rows).for_each(&mut push);
        } else {
            (0..rows).rev().for_each(&mut push);
        }
    }
    Ok(cells)
}

/// Index of the point nearest to `at`; ties resolve to the lowest index.
pub fn nearest_index<'a, I>(points: I, at: StagePoint) -> Option<usize>
where
    I: IntoIterator<Item = &'a StagePoint>,
{
    let mut best: Option<(usize, f64)> = None;
    for (i, p) in points.into_iter().enumerate() {
        let d = p.distance_sq(&at);
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((i, d));
        }
    }
    best.map(|(i, _)| i)
}
