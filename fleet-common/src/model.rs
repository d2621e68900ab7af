//! Model listing types.

use serde::{Deserialize, Serialize};

/// A model file known to the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Sanitized key, equal to the file name inside the model directory.
    pub model_key: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Port of a live worker serving this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ModelEntry {
    pub fn is_running(&self) -> bool {
        self.port.is_some()
    }
}

/// Format a byte count for humans (e.g. `3.56 GB`).
pub fn format_size(size_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size_bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}
