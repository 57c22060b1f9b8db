//! Runtime configuration read from environment variables

use asset_cache::CacheSettings;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Origin prefixes the proxy is willing to fetch from
pub const ALLOWED_ORIGIN_PREFIXES: [&str; 2] = [
    "https://cdn.instructables.com/",
    "https://content.instructables.com/",
];

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub listen_host: String,
    pub cache_enabled: bool,
    pub cache: CacheSettings,
    pub allowed_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8002,
            listen_host: "127.0.0.1".to_string(),
            cache_enabled: true,
            cache: CacheSettings::default(),
            allowed_prefixes: ALLOWED_ORIGIN_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from any key/value source. Unset keys use the
    /// defaults; unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_or(&lookup, "STRUCTABLES_PORT", defaults.port);

        let listen_host = lookup("STRUCTABLES_LISTEN_HOST")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(defaults.listen_host);

        let cache_enabled = match lookup("CACHE_ENABLED") {
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "Invalid CACHE_ENABLED, using default");
                defaults.cache_enabled
            }),
            None => defaults.cache_enabled,
        };

        let dir = lookup("CACHE_DIR")
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.cache.dir);

        let max_age = Duration::from_secs(parse_or(
            &lookup,
            "CACHE_MAX_AGE",
            defaults.cache.max_age.as_secs(),
        ));

        let max_size = parse_or(&lookup, "CACHE_MAX_SIZE", defaults.cache.max_size);

        let cleanup_interval = Duration::from_secs(parse_or(
            &lookup,
            "CACHE_CLEANUP_INTERVAL",
            defaults.cache.cleanup_interval.as_secs(),
        ));

        Self {
            port,
            listen_host,
            cache_enabled,
            cache: CacheSettings {
                dir,
                max_age,
                max_size,
                cleanup_interval,
            },
            allowed_prefixes: defaults.allowed_prefixes,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Invalid value, using default");
            default
        }),
        None => default,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.port, 8002);
        assert_eq!(config.listen_host, "127.0.0.1");
        assert!(config.cache_enabled);
        assert_eq!(config.cache.max_age, Duration::from_secs(604_800));
        assert_eq!(config.cache.max_size, 1024 * 1024 * 1024);
        assert_eq!(config.cache.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.cache.dir, std::env::temp_dir().join("structables-cache"));
        assert_eq!(config.allowed_prefixes.len(), 2);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("STRUCTABLES_PORT", "9000"),
            ("STRUCTABLES_LISTEN_HOST", "0.0.0.0"),
            ("CACHE_ENABLED", "false"),
            ("CACHE_DIR", "/var/cache/structables"),
            ("CACHE_MAX_AGE", "60"),
            ("CACHE_MAX_SIZE", "2048"),
            ("CACHE_CLEANUP_INTERVAL", "30"),
        ]);

        assert_eq!(config.port, 9000);
        assert_eq!(config.listen_host, "0.0.0.0");
        assert!(!config.cache_enabled);
        assert_eq!(config.cache.dir, PathBuf::from("/var/cache/structables"));
        assert_eq!(config.cache.max_age, Duration::from_secs(60));
        assert_eq!(config.cache.max_size, 2048);
        assert_eq!(config.cache.cleanup_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("STRUCTABLES_PORT", "not-a-port"),
            ("CACHE_ENABLED", "maybe"),
            ("CACHE_MAX_SIZE", "-1"),
            ("CACHE_DIR", "  "),
        ]);

        assert_eq!(config.port, 8002);
        assert!(config.cache_enabled);
        assert_eq!(config.cache.max_size, 1024 * 1024 * 1024);
        assert_eq!(config.cache.dir, std::env::temp_dir().join("structables-cache"));
    }

    #[test]
    fn test_parse_bool() {
        for raw in ["1", "true", "TRUE", " yes ", "on"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "false", "False", "no", "off"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("enabled"), None);
    }
}
