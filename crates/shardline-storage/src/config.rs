//! Queue Configuration
//!
//! Controls how a [`FanOutQueue`](crate::FanOutQueue) lays out its segments:
//!
//! - **data_page_size**: bytes of record data per segment (default: 32MB)
//! - **index_page_size**: bytes of index per segment, 8 bytes per record
//!   (default: 1MB, i.e. 131072 records)
//! - **gc_interval_ms**: how often acknowledged segments are reclaimed even
//!   without an ack signal (default: 60s)
//!
//! ## Usage
//!
//! ```ignore
//! use shardline_storage::QueueConfig;
//!
//! let config = QueueConfig {
//!     data_page_size: 1024 * 1024, // 1MB for faster testing
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::segment::INDEX_ENTRY_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Size of each segment's data page in bytes (default: 32MB)
    #[serde(default = "default_data_page_size")]
    pub data_page_size: usize,

    /// Size of each segment's index page in bytes (default: 1MB)
    #[serde(default = "default_index_page_size")]
    pub index_page_size: usize,

    /// Reclamation interval in milliseconds (default: 60s)
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_page_size: default_data_page_size(),
            index_page_size: default_index_page_size(),
            gc_interval_ms: default_gc_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Reject layouts a segment cannot be built from
    pub fn validate(&self) -> Result<()> {
        if self.data_page_size == 0 {
            return Err(Error::InvalidConfig(
                "data_page_size must be greater than zero".to_string(),
            ));
        }
        // Index records hold offsets and lengths as i32.
        if self.data_page_size > i32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "data_page_size {} exceeds {}",
                self.data_page_size,
                i32::MAX
            )));
        }
        if self.index_page_size < INDEX_ENTRY_SIZE || self.index_page_size % INDEX_ENTRY_SIZE != 0
        {
            return Err(Error::InvalidConfig(format!(
                "index_page_size must be a positive multiple of {INDEX_ENTRY_SIZE}"
            )));
        }
        if self.gc_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "gc_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_data_page_size() -> usize {
    32 * 1024 * 1024 // 32MB
}

fn default_index_page_size() -> usize {
    1024 * 1024 // 1MB = 131072 index records
}

fn default_gc_interval_ms() -> u64 {
    60 * 1000 // 1 minute
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        QueueConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: QueueConfig = serde_json::from_str(r#"{"data_page_size": 4096}"#).unwrap();
        assert_eq!(config.data_page_size, 4096);
        assert_eq!(config.index_page_size, 1024 * 1024);
        assert_eq!(config.gc_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_unaligned_index_page() {
        let config = QueueConfig {
            index_page_size: 12,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_empty_data_page() {
        let config = QueueConfig {
            data_page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
