//! File-based blob storage with atomic promotion of completed writes

use crate::error::Result;
use crate::key::{append_suffix, meta_path, CacheKey, META_SUFFIX};
use crate::types::{CacheEntry, CacheMetadata, CacheStats, StoredBlob};
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Content type reported when an entry's metadata is missing or unreadable
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const TMP_DIR: &str = "tmp";
const TMP_SUFFIX: &str = ".tmp";
const STAGING_SUFFIX: &str = ".staging";
const PROBE_FILE: &str = ".write-probe";

/// A blob store rooted at a directory, one blob and one sidecar per URL
pub struct CacheStore {
    /// Directory holding promoted blobs and their sidecars
    root: PathBuf,
    /// Directory holding in-flight writes, never read by lookups
    tmp_dir: PathBuf,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

/// An in-flight write into the cache.
///
/// Owns its temp file: dropping a writer that was neither committed nor
/// aborted deletes the temp file, so a cancelled download leaves nothing
/// behind.
pub struct CacheWriter {
    key: CacheKey,
    url: String,
    file: File,
    temp_path: TempPath,
    written: u64,
}

impl CacheWriter {
    /// Append a chunk to the temp file
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

impl CacheStore {
    /// Create a store rooted at `root`. Call [`CacheStore::init`] before use.
    pub fn new(root: PathBuf) -> Self {
        let tmp_dir = root.join(TMP_DIR);
        Self {
            root,
            tmp_dir,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create the cache directories and check that they are writable
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.tmp_dir).await?;

        let probe = self.root.join(PROBE_FILE);
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;

        info!(cache_dir = ?self.root, "Cache initialized");
        Ok(())
    }

    pub fn temp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Final blob path for a URL
    pub fn blob_path(&self, url: &str) -> PathBuf {
        CacheKey::from_url(url).blob_path(&self.root)
    }

    /// Whether a complete entry for `url` exists and is no older than
    /// `max_age`. Stale entries are removed on the spot.
    pub async fn exists_and_fresh(&self, url: &str, max_age: Duration) -> bool {
        let key = CacheKey::from_url(url);
        let blob_path = key.blob_path(&self.root);

        let fresh = match fs::metadata(&blob_path).await {
            Ok(meta) if meta.is_file() => {
                let age = meta.modified().map(age_of).unwrap_or(Duration::MAX);
                if age <= max_age {
                    true
                } else {
                    self.expire(&key, &blob_path, age, max_age).await;
                    false
                }
            }
            Ok(_) => false,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to stat cached blob, treating as miss");
                }
                false
            }
        };

        if fresh {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Stored content type for `url`, or [`DEFAULT_CONTENT_TYPE`]
    pub async fn read_content_type(&self, url: &str) -> String {
        let key = CacheKey::from_url(url);
        let path = meta_path(&key.blob_path(&self.root));

        match read_metadata(&path).await {
            Ok(meta) if !meta.content_type.is_empty() => meta.content_type,
            Ok(_) => DEFAULT_CONTENT_TYPE.to_string(),
            Err(e) => {
                debug!(key = %key, error = %e, "No usable cache metadata, using default content type");
                DEFAULT_CONTENT_TYPE.to_string()
            }
        }
    }

    /// Open the cached blob for `url`
    pub async fn open_for_read(&self, url: &str) -> Result<File> {
        Ok(File::open(self.blob_path(url)).await?)
    }

    /// Open the blob for `url` if it is fresh, counting a hit only when an
    /// open handle is returned. Freshness is judged from the opened file, so
    /// an entry removed between check and open cannot be reported as a hit.
    pub async fn open_if_fresh(&self, url: &str, max_age: Duration) -> Option<File> {
        let key = CacheKey::from_url(url);
        let blob_path = key.blob_path(&self.root);

        let file = match File::open(&blob_path).await {
            Ok(file) => Some(file),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to open cached blob, treating as miss");
                }
                None
            }
        };

        let fresh = match file {
            Some(file) => match file.metadata().await {
                Ok(meta) if meta.is_file() => {
                    let age = meta.modified().map(age_of).unwrap_or(Duration::MAX);
                    if age <= max_age {
                        Some(file)
                    } else {
                        drop(file);
                        self.expire(&key, &blob_path, age, max_age).await;
                        None
                    }
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to stat cached blob, treating as miss");
                    None
                }
            },
            None => None,
        };

        if fresh.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    async fn expire(&self, key: &CacheKey, blob_path: &Path, age: Duration, max_age: Duration) {
        debug!(key = %key, age_secs = age.as_secs(), max_age_secs = max_age.as_secs(), "Cache entry expired");
        if let Err(e) = self.remove_entry(blob_path).await {
            warn!(key = %key, error = %e, "Failed to remove expired cache entry");
        }
    }

    /// Start writing a new blob for `url` into a uniquely named temp file
    pub async fn begin_write(&self, url: &str) -> Result<CacheWriter> {
        let key = CacheKey::from_url(url);
        let (file, temp_path) = tempfile::Builder::new()
            .prefix(&format!("{}.", key))
            .suffix(TMP_SUFFIX)
            .tempfile_in(&self.tmp_dir)?
            .into_parts();

        debug!(key = %key, temp_path = ?temp_path, "Started cache write");

        Ok(CacheWriter {
            key,
            url: url.to_string(),
            file: File::from_std(file),
            temp_path,
            written: 0,
        })
    }

    /// Record the content type and move the finished blob into place.
    ///
    /// The sidecar is written before the blob is promoted, so once the blob
    /// is visible under its final name its metadata is already there. If
    /// promotion fails, both are removed.
    pub async fn commit_write(&self, writer: CacheWriter, content_type: &str) -> Result<CacheEntry> {
        self.commit_with(writer, content_type, true).await
    }

    /// Commit `writer`, promoting by rename when `rename_first` is set and
    /// by copy otherwise or when the rename fails
    async fn commit_with(
        &self,
        writer: CacheWriter,
        content_type: &str,
        rename_first: bool,
    ) -> Result<CacheEntry> {
        let CacheWriter {
            key,
            url,
            mut file,
            temp_path,
            written,
        } = writer;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let blob_path = key.blob_path(&self.root);
        let metadata = CacheMetadata {
            content_type: content_type.to_string(),
            url,
            stored_at: Utc::now(),
        };
        self.write_metadata(&blob_path, &metadata).await?;

        let renamed = if rename_first {
            fs::rename(&*temp_path, &blob_path).await
        } else {
            Err(std::io::Error::from(ErrorKind::Unsupported))
        };

        match renamed {
            Ok(()) => {
                let _ = temp_path.keep();
            }
            Err(rename_err) => {
                debug!(key = %key, error = %rename_err, "Rename failed, falling back to copy");
                if let Err(e) = copy_into_place(&temp_path, &blob_path).await {
                    if let Err(cleanup) = self.remove_entry(&blob_path).await {
                        warn!(key = %key, error = %cleanup, "Failed to clean up after failed promotion");
                    }
                    return Err(e);
                }
                // The source copy is deleted when `temp_path` drops.
            }
        }

        let meta = fs::metadata(&blob_path).await?;
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        debug!(key = %key, size = written, content_type, "Cached blob");

        Ok(CacheEntry {
            path: blob_path,
            content_type: metadata.content_type,
            size: meta.len(),
            modified,
        })
    }

    /// Discard an in-flight write
    pub fn abort_write(&self, writer: CacheWriter) {
        let CacheWriter {
            key,
            file,
            temp_path,
            written,
            ..
        } = writer;
        drop(file);

        match temp_path.close() {
            Ok(()) => debug!(key = %key, written, "Aborted cache write"),
            Err(e) => warn!(key = %key, error = %e, "Failed to remove aborted cache write"),
        }
    }

    /// All promoted blobs, excluding sidecars and in-flight writes
    pub async fn list_entries(&self) -> Result<Vec<StoredBlob>> {
        let mut blobs = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !CacheKey::is_key(name) {
                continue;
            }

            match entry.metadata().await {
                Ok(meta) if meta.is_file() => blobs.push(StoredBlob {
                    path: entry.path(),
                    modified: modified_at(&meta),
                    size: meta.len(),
                }),
                Ok(_) => {}
                // Removed between listing and stat
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to stat cache entry"),
            }
        }

        Ok(blobs)
    }

    /// Sidecars older than `older_than` whose blob no longer exists
    pub async fn list_orphan_metadata(&self, older_than: Duration) -> Result<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };
            if !CacheKey::is_key(stem) {
                continue;
            }
            if fs::try_exists(self.root.join(stem)).await.unwrap_or(true) {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if meta.modified().map(age_of).unwrap_or(Duration::MAX) > older_than {
                    orphans.push(entry.path());
                }
            }
        }

        Ok(orphans)
    }

    /// Temp files and promotion staging files older than `older_than`,
    /// typically left behind by a process that died mid-write
    pub async fn list_stale_temp_files(&self, older_than: Duration) -> Result<Vec<PathBuf>> {
        let mut stale = Vec::new();

        for (dir_path, suffix) in [(&self.tmp_dir, TMP_SUFFIX), (&self.root, STAGING_SUFFIX)] {
            let mut dir = fs::read_dir(dir_path).await?;
            while let Some(entry) = dir.next_entry().await? {
                let is_leftover = entry
                    .file_name()
                    .to_str()
                    .map(|n| n.ends_with(suffix))
                    .unwrap_or(false);
                if !is_leftover {
                    continue;
                }
                if let Ok(meta) = entry.metadata().await {
                    if meta.is_file()
                        && meta.modified().map(age_of).unwrap_or(Duration::MAX) > older_than
                    {
                        stale.push(entry.path());
                    }
                }
            }
        }

        Ok(stale)
    }

    /// Delete a blob and its sidecar. Already-missing files are fine.
    pub async fn remove_entry(&self, blob_path: &Path) -> Result<()> {
        let blob = remove_if_exists(blob_path).await;
        let meta = remove_if_exists(&meta_path(blob_path)).await;
        blob.and(meta)
    }

    /// Delete a single leftover file (orphan sidecar or stale temp file)
    pub async fn remove_leftover(&self, path: &Path) -> Result<()> {
        remove_if_exists(path).await
    }

    /// Current cache statistics, sized from a directory listing
    pub async fn stats(&self) -> CacheStats {
        let (entries, total_size) = match self.list_entries().await {
            Ok(blobs) => (blobs.len(), blobs.iter().map(|b| b.size).sum()),
            Err(e) => {
                warn!(error = %e, "Failed to list cache entries");
                (0, 0)
            }
        };

        CacheStats {
            entries,
            total_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            last_sweep: None,
        }
    }

    async fn write_metadata(&self, blob_path: &Path, metadata: &CacheMetadata) -> Result<()> {
        let data = serde_json::to_vec(metadata)?;
        let (file, temp_path) = tempfile::Builder::new()
            .suffix(TMP_SUFFIX)
            .tempfile_in(&self.tmp_dir)?
            .into_parts();

        let mut file = File::from_std(file);
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);

        fs::rename(&*temp_path, meta_path(blob_path)).await?;
        let _ = temp_path.keep();
        Ok(())
    }
}

/// Copy `src` next to `dest` and rename the copy over `dest`, for when a
/// direct rename is not possible (e.g. across devices)
async fn copy_into_place(src: &Path, dest: &Path) -> Result<()> {
    let staging = append_suffix(dest, STAGING_SUFFIX);

    let result: std::io::Result<()> = async {
        fs::copy(src, &staging).await?;
        fs::rename(&staging, dest).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&staging).await;
    }
    Ok(result?)
}

async fn read_metadata(path: &Path) -> Result<CacheMetadata> {
    let data = fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}

fn modified_at(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH))
}
