//! Core types for the Structables asset proxy

use asset_cache::CacheStats;
use serde::{Deserialize, Serialize};

/// Query parameters accepted by `/proxy/`
#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub filename: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache_enabled: bool,
    pub cache: Option<CacheStats>,
}
