//! Origin fetching with streaming write-through to the disk cache
//!
//! A request is served from the cache when a fresh entry exists. Otherwise
//! the origin is fetched once and its body is streamed to the client while
//! the same chunks are written to a cache temp file, which is promoted only
//! after the origin stream ends cleanly.

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::validation::{attachment_disposition, validate_origin_url};
use asset_cache::{CacheSettings, CacheStats, CacheStore, CacheWriter, Sweeper};
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Upper bound on the size of chunks read from cached blobs
pub const CHUNK_SIZE: usize = 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("structables-proxy/", env!("CARGO_PKG_VERSION"));

/// Response body handed to the HTTP layer
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where the bytes of a response come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Caching is disabled
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// A proxied asset ready to be streamed to the client
pub struct ProxiedAsset {
    pub body: ByteStream,
    pub content_type: String,
    pub content_disposition: Option<String>,
    pub cache_status: CacheStatus,
}

struct CacheLayer {
    store: Arc<CacheStore>,
    sweeper: Arc<Sweeper>,
    max_age: Duration,
}

/// Streams allow-listed origin assets, caching them on disk when enabled
pub struct AssetProxy {
    client: Client,
    allowed_prefixes: Vec<String>,
    cache: Option<CacheLayer>,
}

impl AssetProxy {
    /// Create a pass-through proxy
    pub fn new(client: Client, allowed_prefixes: Vec<String>) -> Self {
        Self {
            client,
            allowed_prefixes,
            cache: None,
        }
    }

    /// Cache responses in `store`, expiring and sweeping per `settings`
    pub fn with_cache(mut self, store: Arc<CacheStore>, settings: &CacheSettings) -> Self {
        let sweeper = Arc::new(Sweeper::new(store.clone(), settings));
        self.cache = Some(CacheLayer {
            store,
            sweeper,
            max_age: settings.max_age,
        });
        self
    }

    /// Build the proxy described by `config` with a default HTTP client
    pub async fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self::from_config_with_client(config, client).await)
    }

    /// Build the proxy described by `config`.
    ///
    /// A cache directory that cannot be created or written to disables
    /// caching for the life of the process instead of failing startup.
    pub async fn from_config_with_client(config: &Config, client: Client) -> Self {
        let proxy = Self::new(client, config.allowed_prefixes.clone());

        if !config.cache_enabled {
            info!("Asset cache disabled by configuration");
            return proxy;
        }

        let store = CacheStore::new(config.cache.dir.clone());
        match store.init().await {
            Ok(()) => proxy.with_cache(Arc::new(store), &config.cache),
            Err(e) => {
                warn!(
                    cache_dir = ?config.cache.dir,
                    error = %e,
                    "Cache directory is not writable, caching disabled"
                );
                proxy
            }
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache_store(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref().map(|c| &c.store)
    }

    pub fn sweeper(&self) -> Option<&Arc<Sweeper>> {
        self.cache.as_ref().map(|c| &c.sweeper)
    }

    pub async fn cache_stats(&self) -> Option<CacheStats> {
        match &self.cache {
            Some(cache) => Some(cache.sweeper.stats().await),
            None => None,
        }
    }

    /// Serve the asset at `url`, optionally marked as a download named
    /// `filename`
    pub async fn serve(&self, url: Option<&str>, filename: Option<&str>) -> Result<ProxiedAsset> {
        let url = validate_origin_url(url, &self.allowed_prefixes)?;
        let content_disposition = filename.and_then(attachment_disposition);

        let Some(cache) = &self.cache else {
            let (response, content_type) = self.fetch_origin(&url).await?;
            return Ok(ProxiedAsset {
                body: passthrough(response.bytes_stream()),
                content_type,
                content_disposition,
                cache_status: CacheStatus::Bypass,
            });
        };

        self.schedule_sweep(cache);

        if let Some(file) = cache.store.open_if_fresh(&url, cache.max_age).await {
            let content_type = cache.store.read_content_type(&url).await;
            debug!(url = %url, content_type = %content_type, "Serving from cache");
            return Ok(ProxiedAsset {
                body: ReaderStream::with_capacity(file, CHUNK_SIZE).boxed(),
                content_type,
                content_disposition,
                cache_status: CacheStatus::Hit,
            });
        }

        let (response, content_type) = self.fetch_origin(&url).await?;
        let body = match cache.store.begin_write(&url).await {
            Ok(writer) => tee_to_cache(
                response.bytes_stream(),
                writer,
                cache.store.clone(),
                content_type.clone(),
            ),
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to start cache write, serving uncached");
                passthrough(response.bytes_stream())
            }
        };

        Ok(ProxiedAsset {
            body,
            content_type,
            content_disposition,
            cache_status: CacheStatus::Miss,
        })
    }

    /// Open the origin response. Status and content type are checked before
    /// any body bytes are read.
    async fn fetch_origin(&self, url: &str) -> Result<(reqwest::Response, String)> {
        debug!(url, "Fetching from origin");

        let response = self.client.get(url).send().await.map_err(|e| {
            warn!(url, error = %e, "Origin request failed");
            ProxyError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = %status, "Origin returned error status");
            return Err(ProxyError::UpstreamStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                warn!(url, "Origin response has no content type");
                ProxyError::MissingContentType
            })?;

        Ok((response, content_type))
    }

    /// Kick off a sweep in the background if one is due
    fn schedule_sweep(&self, cache: &CacheLayer) {
        if !cache.sweeper.is_due() {
            return;
        }
        let sweeper = cache.sweeper.clone();
        tokio::spawn(async move {
            sweeper.maybe_sweep().await;
        });
    }
}

fn passthrough<S, E>(upstream: S) -> ByteStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError>,
{
    upstream.map(|chunk| chunk.map_err(std::io::Error::other)).boxed()
}

struct Tee<S> {
    upstream: S,
    writer: Option<CacheWriter>,
    store: Arc<CacheStore>,
    content_type: String,
    failed: bool,
}

/// Forward `upstream` while copying every chunk into `writer`.
///
/// The entry is committed when the upstream ends, aborted when it errors.
/// If the cache write itself fails, the write is dropped and streaming
/// continues uncached. Dropping the returned stream early (client went away)
/// drops the writer, which deletes its temp file.
fn tee_to_cache<S, E>(
    upstream: S,
    writer: CacheWriter,
    store: Arc<CacheStore>,
    content_type: String,
) -> ByteStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Into<BoxError> + Send + 'static,
{
    let tee = Tee {
        upstream: Box::pin(upstream),
        writer: Some(writer),
        store,
        content_type,
        failed: false,
    };

    stream::unfold(tee, |mut tee| async move {
        if tee.failed {
            return None;
        }

        match tee.upstream.next().await {
            Some(Ok(chunk)) => {
                if let Some(writer) = tee.writer.as_mut() {
                    if let Err(e) = writer.write_chunk(&chunk).await {
                        warn!(key = %writer.key(), error = %e, "Cache write failed, continuing uncached");
                        if let Some(writer) = tee.writer.take() {
                            tee.store.abort_write(writer);
                        }
                    }
                }
                Some((Ok(chunk), tee))
            }
            Some(Err(e)) => {
                warn!(error = %e, "Origin stream failed mid-transfer");
                if let Some(writer) = tee.writer.take() {
                    tee.store.abort_write(writer);
                }
                tee.failed = true;
                Some((Err(std::io::Error::other(e)), tee))
            }
            None => {
                if let Some(writer) = tee.writer.take() {
                    let key = writer.key().clone();
                    match tee.store.commit_write(writer, &tee.content_type).await {
                        Ok(entry) => debug!(key = %key, size = entry.size, "Committed cache entry"),
                        Err(e) => warn!(key = %key, error = %e, "Failed to commit cache entry"),
                    }
                }
                None
            }
        }
    })
    .boxed()
}
