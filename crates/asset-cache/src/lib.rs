//! File-based asset cache with TTL expiration and size-bounded sweeping
//!
//! Stores remote assets on disk as one blob plus one JSON metadata sidecar
//! per URL. There is no index: the directory listing is the source of truth.
//! In-flight writes go to uniquely named temp files and are promoted into
//! place with a rename, so readers never observe a partial blob.

mod error;
mod key;
mod store;
mod sweeper;
mod types;

pub use error::{CacheError, Result};
pub use key::{CacheKey, META_SUFFIX};
pub use store::{CacheStore, CacheWriter, DEFAULT_CONTENT_TYPE};
pub use sweeper::{plan_sweep, SweepPlan, SweepState, Sweeper};
pub use types::{CacheEntry, CacheMetadata, CacheSettings, CacheStats, StoredBlob, SweepReport};
