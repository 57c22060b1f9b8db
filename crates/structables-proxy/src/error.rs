//! Error types for the Structables asset proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// No `url` query parameter
    MissingUrl,
    /// URL is malformed or not under an allowed origin prefix
    InvalidUrl(String),
    /// Origin answered with a non-success status
    UpstreamStatus(u16),
    /// Origin response had no usable Content-Type
    MissingContentType,
    Http(Box<reqwest::Error>),
    Io(Box<std::io::Error>),
    Config(String),
}

impl ProxyError {
    /// Whether the caller sent a bad request, as opposed to an upstream or
    /// server-side failure
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProxyError::MissingUrl | ProxyError::InvalidUrl(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingUrl | ProxyError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamStatus(code) => StatusCode::from_u16(*code)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            ProxyError::Http(_) | ProxyError::MissingContentType => StatusCode::BAD_GATEWAY,
            ProxyError::Io(_) | ProxyError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::MissingUrl => write!(f, "Missing url parameter"),
            ProxyError::InvalidUrl(msg) => write!(f, "Invalid url: {}", msg),
            ProxyError::UpstreamStatus(code) => write!(f, "Origin returned status {}", code),
            ProxyError::MissingContentType => write!(f, "Origin response has no content type"),
            ProxyError::Http(err) => write!(f, "HTTP error: {}", err),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Http(err) => Some(err.as_ref()),
            ProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Http(Box::new(err))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() && !matches!(self, ProxyError::UpstreamStatus(_))
        {
            tracing::error!(error = %self, "Proxy request failed");
            status.canonical_reason().unwrap_or("Error").to_string()
        } else {
            self.to_string()
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
