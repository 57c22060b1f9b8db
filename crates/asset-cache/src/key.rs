//! Cache key derivation and on-disk path layout

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Suffix appended to a blob path to name its metadata sidecar
pub const META_SUFFIX: &str = ".meta";

/// Length of a hex-encoded SHA-256 digest
const KEY_LEN: usize = 64;

/// Deterministic identity of a cached asset, derived from its origin URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for an origin URL.
    ///
    /// URLs that parse are hashed in their serialized form so trivially
    /// different spellings of the same URL (host case, default port) share
    /// an entry. Anything else is hashed verbatim.
    pub fn from_url(url: &str) -> Self {
        let normalized = url::Url::parse(url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.to_string());

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Whether a file name is a blob name (a bare key)
    pub fn is_key(name: &str) -> bool {
        name.len() == KEY_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the blob for this key under `root`
    pub fn blob_path(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of the metadata sidecar belonging to a blob
pub(crate) fn meta_path(blob_path: &Path) -> PathBuf {
    append_suffix(blob_path, META_SUFFIX)
}

pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
