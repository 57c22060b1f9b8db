//! Streaming asset proxy for the Structables front-end
//!
//! Allow-listed Instructables CDN assets are streamed to clients and, when
//! enabled, written through to an [`asset_cache`] disk cache.

pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod types;
pub mod validation;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use proxy::{AssetProxy, CacheStatus, ProxiedAsset};
pub use server::{create_router, start_server, ServerState, SharedState};
