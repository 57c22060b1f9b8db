//! Origin URL allow-listing and download headers

use crate::error::{ProxyError, Result};

/// Validate the `url` query parameter and return the origin URL to fetch.
///
/// The value is percent-decoded once more (front-end pages emit it quoted)
/// and must start with one of `allowed_prefixes`. The parsed URL must also
/// have the prefix's scheme, host and port and carry no credentials, so a
/// textual prefix match cannot smuggle in a different authority.
pub fn validate_origin_url(raw: Option<&str>, allowed_prefixes: &[String]) -> Result<String> {
    let raw = raw.map(str::trim).filter(|u| !u.is_empty()).ok_or(ProxyError::MissingUrl)?;

    let decoded = urlencoding::decode(raw)
        .map_err(|_| ProxyError::InvalidUrl("url is not valid percent-encoded UTF-8".to_string()))?
        .into_owned();

    let prefix = allowed_prefixes
        .iter()
        .find(|p| decoded.starts_with(p.as_str()))
        .ok_or_else(|| ProxyError::InvalidUrl("origin not allowed".to_string()))?;

    let parsed = url::Url::parse(&decoded)
        .map_err(|e| ProxyError::InvalidUrl(format!("unparseable url: {}", e)))?;

    if !same_origin(&parsed, prefix) {
        return Err(ProxyError::InvalidUrl("origin not allowed".to_string()));
    }

    Ok(decoded)
}

fn same_origin(parsed: &url::Url, prefix: &str) -> bool {
    let Ok(expected) = url::Url::parse(prefix) else {
        return false;
    };
    parsed.scheme() == expected.scheme()
        && parsed.host_str() == expected.host_str()
        && parsed.port_or_known_default() == expected.port_or_known_default()
        && parsed.username().is_empty()
        && parsed.password().is_none()
}

/// Build a `Content-Disposition` value that marks the response as a
/// download. Characters that could break out of the quoted filename are
/// dropped.
pub fn attachment_disposition(filename: &str) -> Option<String> {
    let cleaned: String = filename
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        return None;
    }
    Some(format!("attachment; filename=\"{}\"", cleaned))
}
