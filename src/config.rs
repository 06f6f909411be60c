use std::env;

use tracing::{debug, warn};

use crate::auth::Credentials;

pub const DEFAULT_API_BASE_URL: &str = "https://api.twitter.com/1.1";
pub const DEFAULT_STREAM_URL: &str = "https://userstream.twitter.com/1.1/user.json";
pub const DEFAULT_BOOTSTRAP_COUNT: u32 = 200;

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub stream_url: String,
    pub bootstrap_count: u32,
    pub credentials: Credentials,
}

impl Config {
    /// Loads `.env` (if present) into the process environment, then reads it.
    pub fn load() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(error) if error.not_found() => {}
            Err(error) => warn!(%error, "failed to load .env"),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = lookup("TDM_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let stream_url = lookup("TDM_STREAM_URL").unwrap_or_else(|| DEFAULT_STREAM_URL.to_string());
        let bootstrap_count = match lookup("TDM_BOOTSTRAP_COUNT") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(count) if count > 0 => count,
                _ => {
                    warn!(value = %raw, "ignoring invalid TDM_BOOTSTRAP_COUNT");
                    DEFAULT_BOOTSTRAP_COUNT
                }
            },
            None => DEFAULT_BOOTSTRAP_COUNT,
        };

        Self {
            api_base_url,
            stream_url,
            bootstrap_count,
            credentials: Credentials::from_lookup(&lookup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.stream_url, DEFAULT_STREAM_URL);
        assert_eq!(config.bootstrap_count, 200);
        assert_eq!(config.credentials.missing().len(), 4);
    }

    #[test]
    fn overrides_are_read() {
        let config = config_from(&[
            ("TDM_API_BASE_URL", "http://localhost:9000/1.1/"),
            ("TDM_STREAM_URL", "http://localhost:9001/user.json"),
            ("TDM_BOOTSTRAP_COUNT", "50"),
            ("CONSUMER_KEY", "ck"),
            ("CONSUMER_SECRET", "cs"),
            ("ACCESS_TOKEN", "at"),
            ("ACCESS_TOKEN_SECRET", "ats"),
        ]);
        assert_eq!(config.api_base_url, "http://localhost:9000/1.1");
        assert_eq!(config.stream_url, "http://localhost:9001/user.json");
        assert_eq!(config.bootstrap_count, 50);
        assert!(config.credentials.missing().is_empty());
        assert_eq!(config.credentials.access_token_secret, "ats");
    }

    #[test]
    fn invalid_bootstrap_count_falls_back() {
        assert_eq!(config_from(&[("TDM_BOOTSTRAP_COUNT", "0")]).bootstrap_count, 200);
        assert_eq!(config_from(&[("TDM_BOOTSTRAP_COUNT", "lots")]).bootstrap_count, 200);
    }
}
