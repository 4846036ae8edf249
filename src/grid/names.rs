//! Device labels in visiting order.
//!
//! A label is two letters and a suffix, `AB_1`. One column to the right
//! advances the second letter (A..Z, wrapping). One row down flips the suffix
//! 2→1, or 1→2 while stepping the first letter back one (wrapping), so every
//! first letter covers two rows.

use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceName {
    first: u8,
    second: u8,
    suffix: u8,
}

impl DeviceName {
    fn parse(text: &str) -> Option<Self> {
        let (letters, suffix) = text.trim().split_once('_')?;
        let letters = letters.as_bytes();
        if letters.len() != 2 || !letters.iter().all(u8::is_ascii_alphabetic) {
            return None;
        }
        let suffix = match suffix {
            "1" => 1,
            "2" => 2,
            _ => return None,
        };
        Some(Self {
            first: letters[0].to_ascii_uppercase() - b'A',
            second: letters[1].to_ascii_uppercase() - b'A',
            suffix,
        })
    }

    fn step_right(self, steps: u32) -> Self {
        Self {
            second: ((self.second as u32 + steps) % 26) as u8,
            ..self
        }
    }

    fn step_down(self) -> Self {
        if self.suffix == 2 {
            Self { suffix: 1, ..self }
        } else {
            Self {
                first: (self.first + 25) % 26,
                suffix: 2,
                ..self
            }
        }
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}_{}",
            (b'A' + self.first) as char,
            (b'A' + self.second) as char,
            self.suffix
        )
    }
}

fn fallback(rows: u32, cols: u32) -> Vec<String> {
    (0..rows as usize * cols as usize)
        .map(|i| format!("Dev_{}", i))
        .collect()
}

/// Label every device, in the same serpentine order as
/// [`super::plan_grid`].
///
/// Without a well-formed top-left label the whole grid gets `Dev_0`,
/// `Dev_1`, ... The top-right and bottom-right labels, when supplied, are only
/// cross-checked: a mismatch is logged and the derived label is kept.
pub fn plan_names(
    top_left: Option<&str>,
    top_right: Option<&str>,
    bottom_right: Option<&str>,
    rows: u32,
    cols: u32,
) -> Vec<String> {
    let Some(origin) = top_left.and_then(DeviceName::parse) else {
        debug!(?top_left, "No usable top-left label, numbering devices");
        return fallback(rows, cols);
    };
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    // grid[c][r], column-major to match the visiting order
    let grid: Vec<Vec<DeviceName>> = (0..cols)
        .map(|c| {
            let mut name = origin.step_right(c);
            let mut column = Vec::with_capacity(rows as usize);
            column.push(name);
            for _ in 1..rows {
                name = name.step_down();
                column.push(name);
            }
            column
        })
        .collect();

    let last_col = &grid[cols as usize - 1];
    cross_check("top-right", top_right, last_col[0]);
    cross_check("bottom-right", bottom_right, last_col[rows as usize - 1]);

    let mut names = Vec::with_capacity(rows as usize * cols as usize);
    for (c, column) in grid.iter().enumerate() {
        if c % 2 == 0 {
            names.extend(column.iter().map(ToString::to_string));
        } else {
            names.extend(column.iter().rev().map(ToString::to_string));
        }
    }
    names
}

fn cross_check(corner: &str, supplied: Option<&str>, derived: DeviceName) {
    let Some(supplied) = supplied.map(str::trim).filter(|s| !s.is_empty()) else {
        return;
    };
    match DeviceName::parse(supplied) {
        Some(given) if given == derived => {}
        _ => warn!(
            corner,
            derived = %derived,
            supplied,
            "Supplied device label disagrees with derived label; keeping derived"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_two_by_three_from_aa1() {
        let names = plan_names(Some("AA_1"), None, None, 2, 3);
        assert_eq!(names, vec!["AA_1", "ZA_2", "ZB_2", "AB_1", "AC_1", "ZC_2"]);
    }

    #[test]
    fn test_suffix_two_starts_with_toggle_down() {
        let names = plan_names(Some("CY_2"), None, None, 3, 3);
        // column 0 top to bottom
        assert_eq!(&names[0..3], &["CY_2", "CY_1", "BY_2"]);
        // column 1 bottom to top, second letter advanced
        assert_eq!(&names[3..6], &["BZ_2", "CZ_1", "CZ_2"]);
        // column 2 wraps Z -> A
        assert_eq!(&names[6..9], &["CA_2", "CA_1", "BA_2"]);
    }

    #[test]
    fn test_lowercase_is_accepted() {
        let names = plan_names(Some("ab_1"), None, None, 1, 2);
        assert_eq!(names, vec!["AB_1", "AC_1"]);
    }

    #[test]
    fn test_fallback_names() {
        assert_eq!(
            plan_names(None, None, None, 2, 2),
            vec!["Dev_0", "Dev_1", "Dev_2", "Dev_3"]
        );
        assert_eq!(plan_names(Some("A_1"), None, None, 1, 2), vec!["Dev_0", "Dev_1"]);
        assert_eq!(plan_names(Some("AAA"), None, None, 1, 1), vec!["Dev_0"]);
        assert_eq!(plan_names(Some("AA_3"), None, None, 1, 1), vec!["Dev_0"]);
    }

    #[traced_test]
    #[test]
    fn test_corner_label_mismatch_is_logged_not_applied() {
        let names = plan_names(Some("AA_1"), Some("QQ_1"), Some("AC_1"), 1, 3);
        assert_eq!(names, vec!["AA_1", "AB_1", "AC_1"]);
        assert!(logs_contain("disagrees"));
    }

    #[test]
    fn test_matching_corner_labels_pass() {
        let names = plan_names(Some("AA_1"), Some("AC_1"), Some("ZC_2"), 2, 3);
        assert_eq!(names.len(), 6);
    }
}
