//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A live cache entry: a promoted blob and its content type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub content_type: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Contents of the `.meta` sidecar written next to every blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub content_type: String,
    pub url: String,
    pub stored_at: DateTime<Utc>,
}

/// One blob found by a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub last_sweep: Option<DateTime<Utc>>,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub evicted: usize,
    pub leftovers_removed: usize,
    pub failures: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Tunables for the on-disk cache
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub max_age: Duration,
    pub max_size: u64,
    pub cleanup_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("structables-cache"),
            max_age: Duration::from_secs(7 * 24 * 60 * 60), // 1 week
            max_size: 1024 * 1024 * 1024,                    // 1GB
            cleanup_interval: Duration::from_secs(60 * 60),  // 1 hour
        }
    }
}
