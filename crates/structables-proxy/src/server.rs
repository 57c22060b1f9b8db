//! HTTP server for the asset proxy
//!
//! Provides /health and /proxy/ endpoints.

use crate::proxy::{AssetProxy, ProxiedAsset};
use crate::types::{HealthResponse, ProxyQuery};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub proxy: AssetProxy,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(proxy: AssetProxy) -> Self {
        Self {
            proxy,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Reports whether the body came from the cache
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/proxy/", get(proxy_asset))
        .route("/proxy", get(proxy_asset))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, host: &str, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache_enabled: state.proxy.cache_enabled(),
        cache: state.proxy.cache_stats().await,
    })
}

/// Stream an allow-listed origin asset, from the cache when possible
async fn proxy_asset(
    State(state): State<SharedState>,
    Query(query): Query<ProxyQuery>,
) -> Response {
    match state
        .proxy
        .serve(query.url.as_deref(), query.filename.as_deref())
        .await
    {
        Ok(asset) => asset_response(asset),
        Err(e) => {
            if e.is_client_error() {
                info!(url = ?query.url, error = %e, "Rejected proxy request");
            } else {
                warn!(url = ?query.url, error = %e, "Failed to proxy asset");
            }
            e.into_response()
        }
    }
}

fn asset_response(asset: ProxiedAsset) -> Response {
    let content_type = HeaderValue::try_from(asset.content_type.as_str()).unwrap_or_else(|_| {
        warn!(content_type = %asset.content_type, "Unrepresentable content type, using default");
        HeaderValue::from_static(asset_cache::DEFAULT_CONTENT_TYPE)
    });

    let mut response = Body::from_stream(asset.body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(X_CACHE, HeaderValue::from_static(asset.cache_status.as_str()));

    if let Some(disposition) = asset.content_disposition {
        match HeaderValue::try_from(disposition) {
            Ok(value) => {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            Err(e) => warn!(error = %e, "Dropping unrepresentable Content-Disposition"),
        }
    }

    response
}
