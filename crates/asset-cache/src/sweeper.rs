//! Expiry and size-bound eviction over the whole store
//!
//! A sweep is cheap to request: [`Sweeper::maybe_sweep`] returns immediately
//! unless the cleanup interval has elapsed, and only one caller can win the
//! right to run it.

use crate::store::CacheStore;
use crate::types::{CacheSettings, CacheStats, StoredBlob, SweepReport};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Time of the last sweep, shared by every request
#[derive(Debug, Default)]
pub struct SweepState {
    /// Unix milliseconds; zero means never swept
    last_sweep_ms: AtomicI64,
}

impl SweepState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sweep(&self) -> Option<DateTime<Utc>> {
        match self.last_sweep_ms.load(Ordering::Acquire) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        elapsed_enough(self.last_sweep_ms.load(Ordering::Acquire), now, interval)
    }

    /// Claim the next sweep, stamping it with `now`.
    ///
    /// Returns false if the interval has not elapsed or another caller
    /// claimed it first. The stamp is the sweep's start time and is never
    /// rolled back, so a failing sweep still waits a full interval.
    pub fn try_claim(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        let now_ms = now.timestamp_millis();
        let mut last = self.last_sweep_ms.load(Ordering::Acquire);

        loop {
            if !elapsed_enough(last, now, interval) {
                return false;
            }
            match self.last_sweep_ms.compare_exchange_weak(
                last,
                now_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }
}

fn elapsed_enough(last_ms: i64, now: DateTime<Utc>, interval: Duration) -> bool {
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_sub(last_ms) >= interval_ms
}

/// What a sweep would remove, before touching the filesystem
#[derive(Debug, Default)]
pub struct SweepPlan {
    pub expired: Vec<StoredBlob>,
    pub evicted: Vec<StoredBlob>,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Decide which entries to expire and which to evict.
///
/// Entries older than `max_age` are expired first. If the rest still exceed
/// `max_size`, they are evicted oldest-write-first until the total fits.
pub fn plan_sweep(
    entries: Vec<StoredBlob>,
    now: DateTime<Utc>,
    max_age: Duration,
    max_size: u64,
) -> SweepPlan {
    let bytes_before: u64 = entries.iter().map(|e| e.size).sum();

    let (expired, mut remaining): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|e| age_at(now, e) > max_age);

    let mut total = bytes_before - expired.iter().map(|e| e.size).sum::<u64>();
    let mut evicted = Vec::new();

    if total > max_size {
        remaining.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        for entry in remaining {
            if total <= max_size {
                break;
            }
            total -= entry.size;
            evicted.push(entry);
        }
    }

    SweepPlan {
        expired,
        evicted,
        bytes_before,
        bytes_after: total,
    }
}

fn age_at(now: DateTime<Utc>, entry: &StoredBlob) -> Duration {
    (now - entry.modified).to_std().unwrap_or(Duration::ZERO)
}

/// Runs sweeps over a [`CacheStore`] at most once per cleanup interval
pub struct Sweeper {
    store: Arc<CacheStore>,
    max_age: Duration,
    max_size: u64,
    interval: Duration,
    state: SweepState,
}

impl Sweeper {
    pub fn new(store: Arc<CacheStore>, settings: &CacheSettings) -> Self {
        Self {
            store,
            max_age: settings.max_age,
            max_size: settings.max_size,
            interval: settings.cleanup_interval,
            state: SweepState::new(),
        }
    }

    /// Whether a sweep would run if requested now
    pub fn is_due(&self) -> bool {
        self.state.is_due(Utc::now(), self.interval)
    }

    pub fn last_sweep(&self) -> Option<DateTime<Utc>> {
        self.state.last_sweep()
    }

    /// Sweep if the cleanup interval has elapsed, otherwise do nothing.
    /// Never fails; problems are logged and counted in the report.
    pub async fn maybe_sweep(&self) -> Option<SweepReport> {
        let started = Utc::now();
        if !self.state.try_claim(started, self.interval) {
            return None;
        }
        Some(self.sweep(started).await)
    }

    /// Store statistics including the last sweep time
    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.store.stats().await;
        stats.last_sweep = self.last_sweep();
        stats
    }

    async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let entries = match self.store.list_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Cache sweep could not list entries");
                return SweepReport {
                    failures: 1,
                    ..Default::default()
                };
            }
        };

        let mut report = SweepReport {
            scanned: entries.len(),
            ..Default::default()
        };

        let plan = plan_sweep(entries, now, self.max_age, self.max_size);
        report.bytes_before = plan.bytes_before;
        let mut remaining = plan.bytes_before;

        for entry in plan.expired {
            match self.store.remove_entry(&entry.path).await {
                Ok(()) => {
                    report.expired += 1;
                    remaining -= entry.size;
                }
                Err(e) => {
                    warn!(path = ?entry.path, error = %e, "Failed to remove expired cache entry");
                    report.failures += 1;
                }
            }
        }

        for entry in plan.evicted {
            match self.store.remove_entry(&entry.path).await {
                Ok(()) => {
                    debug!(path = ?entry.path, size = entry.size, "Evicted cache entry");
                    report.evicted += 1;
                    remaining -= entry.size;
                }
                Err(e) => {
                    warn!(path = ?entry.path, error = %e, "Failed to evict cache entry");
                    report.failures += 1;
                }
            }
        }
        report.bytes_after = remaining;

        self.remove_leftovers(&mut report).await;

        info!(
            scanned = report.scanned,
            expired = report.expired,
            evicted = report.evicted,
            leftovers = report.leftovers_removed,
            failures = report.failures,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            "Cache sweep finished"
        );

        report
    }

    async fn remove_leftovers(&self, report: &mut SweepReport) {
        let mut leftovers = Vec::new();

        match self.store.list_orphan_metadata(self.max_age).await {
            Ok(paths) => leftovers.extend(paths),
            Err(e) => warn!(error = %e, "Failed to list orphaned cache metadata"),
        }
        match self.store.list_stale_temp_files(self.max_age).await {
            Ok(paths) => leftovers.extend(paths),
            Err(e) => warn!(error = %e, "Failed to list stale cache temp files"),
        }

        for path in leftovers {
            match self.store.remove_leftover(&path).await {
                Ok(()) => report.leftovers_removed += 1,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to remove cache leftover");
                    report.failures += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{new_store, put, set_age};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn blob(name: &str, size: u64, age_secs: i64, now: DateTime<Utc>) -> StoredBlob {
        StoredBlob {
            path: PathBuf::from(name),
            modified: now - chrono::Duration::seconds(age_secs),
            size,
        }
    }

    fn names(blobs: &[StoredBlob]) -> Vec<&str> {
        blobs.iter().map(|b| b.path.to_str().unwrap()).collect()
    }

    fn settings(dir: &std::path::Path, max_size: u64) -> CacheSettings {
        CacheSettings {
            dir: dir.to_path_buf(),
            max_age: Duration::from_secs(1000),
            max_size,
            cleanup_interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_plan_expires_old_entries() {
        let now = Utc::now();
        let plan = plan_sweep(
            vec![blob("fresh", 10, 10, now), blob("stale", 20, 5000, now)],
            now,
            Duration::from_secs(1000),
            u64::MAX,
        );

        assert_eq!(names(&plan.expired), vec!["stale"]);
        assert!(plan.evicted.is_empty());
        assert_eq!(plan.bytes_before, 30);
        assert_eq!(plan.bytes_after, 10);
    }

    #[test]
    fn test_plan_evicts_oldest_first_until_under_limit() {
        let now = Utc::now();
        let plan = plan_sweep(
            vec![
                blob("newest", 10, 100, now),
                blob("oldest", 10, 300, now),
                blob("middle", 10, 200, now),
            ],
            now,
            Duration::from_secs(1000),
            20,
        );

        assert!(plan.expired.is_empty());
        assert_eq!(names(&plan.evicted), vec!["oldest"]);
        assert_eq!(plan.bytes_after, 20);
    }

    #[test]
    fn test_plan_keeps_evicting_while_over_limit() {
        let now = Utc::now();
        let plan = plan_sweep(
            vec![
                blob("a", 5, 400, now),
                blob("b", 5, 300, now),
                blob("c", 50, 200, now),
                blob("d", 5, 100, now),
            ],
            now,
            Duration::from_secs(1000),
            10,
        );

        // The small old entries go first even though the big one alone would suffice
        assert_eq!(names(&plan.evicted), vec!["a", "b", "c"]);
        assert_eq!(plan.bytes_after, 5);
    }

    #[test]
    fn test_plan_under_limit_is_empty() {
        let now = Utc::now();
        let plan = plan_sweep(
            vec![blob("a", 5, 10, now), blob("b", 5, 20, now)],
            now,
            Duration::from_secs(1000),
            10,
        );

        assert!(plan.expired.is_empty());
        assert!(plan.evicted.is_empty());
        assert_eq!(plan.bytes_after, 10);
    }

    #[test]
    fn test_plan_counts_expired_bytes_before_size_pass() {
        let now = Utc::now();
        let plan = plan_sweep(
            vec![blob("expired", 100, 5000, now), blob("kept", 10, 10, now)],
            now,
            Duration::from_secs(1000),
            50,
        );

        assert_eq!(names(&plan.expired), vec!["expired"]);
        assert!(plan.evicted.is_empty());
    }

    #[test]
    fn test_sweep_state_claims_once_per_interval() {
        let state = SweepState::new();
        let interval = Duration::from_secs(3600);
        let now = Utc::now();

        assert!(state.last_sweep().is_none());
        assert!(state.is_due(now, interval));
        assert!(state.try_claim(now, interval));
        assert!(state.last_sweep().is_some());

        let soon = now + chrono::Duration::seconds(60);
        assert!(!state.is_due(soon, interval));
        assert!(!state.try_claim(soon, interval));

        let later = now + chrono::Duration::seconds(3600);
        assert!(state.try_claim(later, interval));
    }

    #[test]
    fn test_sweep_state_zero_interval_always_due() {
        let state = SweepState::new();
        let now = Utc::now();
        assert!(state.try_claim(now, Duration::ZERO));
        assert!(state.try_claim(now, Duration::ZERO));
    }

    #[test]
    fn test_sweep_state_single_winner_under_contention() {
        let state = SweepState::new();
        let now = Utc::now();
        let interval = Duration::from_secs(3600);

        let winners = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| s.spawn(|| state.try_claim(now, interval)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });

        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_sweep_enforces_max_size_oldest_first() {
        let dir = tempdir().unwrap();
        let store = Arc::new(new_store(dir.path()).await);

        let urls = [
            ("https://cdn.instructables.com/1.png", 300),
            ("https://cdn.instructables.com/2.png", 200),
            ("https://cdn.instructables.com/3.png", 100),
        ];
        for (url, age) in urls {
            put(&store, url, b"0123456789", "image/png").await;
            set_age(&store.blob_path(url), Duration::from_secs(age));
        }

        let sweeper = Sweeper::new(store.clone(), &settings(dir.path(), 20));
        let report = sweeper.maybe_sweep().await.unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.bytes_after, 20);
        assert!(!store.blob_path(urls[0].0).exists());
        assert!(store.blob_path(urls[1].0).exists());
        assert!(store.blob_path(urls[2].0).exists());
        assert!(sweeper.last_sweep().is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let dir = tempdir().unwrap();
        let store = Arc::new(new_store(dir.path()).await);

        let old = "https://content.instructables.com/old.pdf";
        let new = "https://content.instructables.com/new.pdf";
        put(&store, old, b"old", "application/pdf").await;
        put(&store, new, b"new", "application/pdf").await;
        set_age(&store.blob_path(old), Duration::from_secs(5000));

        let sweeper = Sweeper::new(store.clone(), &settings(dir.path(), u64::MAX));
        let report = sweeper.maybe_sweep().await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 0);
        assert!(!store.blob_path(old).exists());
        assert!(store.blob_path(new).exists());
    }

    #[tokio::test]
    async fn test_sweep_before_interval_is_noop() {
        let dir = tempdir().unwrap();
        let store = Arc::new(new_store(dir.path()).await);
        let sweeper = Sweeper::new(store.clone(), &settings(dir.path(), u64::MAX));

        assert!(sweeper.maybe_sweep().await.is_some());
        let first = sweeper.last_sweep();

        let url = "https://cdn.instructables.com/expired.jpg";
        put(&store, url, b"stale", "image/jpeg").await;
        set_age(&store.blob_path(url), Duration::from_secs(5000));

        assert!(!sweeper.is_due());
        assert!(sweeper.maybe_sweep().await.is_none());
        assert!(store.blob_path(url).exists());
        assert_eq!(sweeper.last_sweep(), first);
    }

    #[tokio::test]
    async fn test_sweep_removes_leftovers() {
        let dir = tempdir().unwrap();
        let store = Arc::new(new_store(dir.path()).await);

        let stale_tmp = store.temp_dir().join("crashed.xyz.tmp");
        std::fs::write(&stale_tmp, b"partial").unwrap();
        set_age(&stale_tmp, Duration::from_secs(5000));

        let sweeper = Sweeper::new(store.clone(), &settings(dir.path(), u64::MAX));
        let report = sweeper.maybe_sweep().await.unwrap();

        assert_eq!(report.leftovers_removed, 1);
        assert!(!stale_tmp.exists());
    }

    #[tokio::test]
    async fn test_failed_sweep_still_advances_last_sweep() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let store = Arc::new(new_store(&root).await);
        std::fs::remove_dir_all(&root).unwrap();

        let sweeper = Sweeper::new(store, &settings(&root, u64::MAX));
        let report = sweeper.maybe_sweep().await.unwrap();

        assert_eq!(report.failures, 1);
        assert!(sweeper.last_sweep().is_some());
        assert!(sweeper.maybe_sweep().await.is_none());
    }

    #[tokio::test]
    async fn test_stats_include_last_sweep() {
        let dir = tempdir().unwrap();
        let store = Arc::new(new_store(dir.path()).await);
        put(&store, "https://cdn.instructables.com/a.png", b"abc", "image/png").await;

        let sweeper = Sweeper::new(store, &settings(dir.path(), u64::MAX));
        assert!(sweeper.stats().await.last_sweep.is_none());

        sweeper.maybe_sweep().await;
        let stats = sweeper.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_size, 3);
        assert!(stats.last_sweep.is_some());
    }
}
