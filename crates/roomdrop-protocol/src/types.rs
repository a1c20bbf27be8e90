use std::fmt;

use serde::{Deserialize, Serialize};

/// Local handle for a transfer item. Independent of the content identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Bytes per megabyte used for `fileSize`.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Convert a byte length to the floating-point megabytes carried on the wire.
pub fn size_in_mb(len: usize) -> f64 {
    len as f64 / BYTES_PER_MB
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_ids_are_unique() {
        assert_ne!(ItemId::new(), ItemId::new());
    }

    #[test]
    fn two_megabytes() {
        assert_eq!(size_in_mb(2 * 1024 * 1024), 2.0);
    }
}
