//! Persisted device-alignment bias.
//!
//! The file holds two comma-separated integers, `x,y`. A missing or
//! unreadable file means no bias.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Pixel offset added to every detected pad center.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBias {
    /// Horizontal offset
    pub x: i32,
    /// Vertical offset
    pub y: i32,
}

impl DeviceBias {
    /// Parse `x,y`; surrounding whitespace is ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let (x, y) = text.trim().split_once(',')?;
        Some(Self {
            x: x.trim().parse().ok()?,
            y: y.trim().parse().ok()?,
        })
    }
}

/// Read the bias file, defaulting to (0, 0).
pub fn read_bias_file(path: &Path) -> DeviceBias {
    match std::fs::read_to_string(path) {
        Ok(text) => DeviceBias::parse(&text).unwrap_or_else(|| {
            warn!(path = %path.display(), "Malformed bias file, using (0, 0)");
            DeviceBias::default()
        }),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No bias file, using (0, 0)");
            DeviceBias::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse() {
        assert_eq!(DeviceBias::parse("3,-4\n"), Some(DeviceBias { x: 3, y: -4 }));
        assert_eq!(DeviceBias::parse(" 7 , 0 "), Some(DeviceBias { x: 7, y: 0 }));
        assert_eq!(DeviceBias::parse("7"), None);
        assert_eq!(DeviceBias::parse("a,b"), None);
    }

    #[test]
    fn test_read_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "12,5").unwrap();
        assert_eq!(read_bias_file(file.path()), DeviceBias { x: 12, y: 5 });
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(
            read_bias_file(&dir.path().join("absent.txt")),
            DeviceBias::default()
        );
    }
}
