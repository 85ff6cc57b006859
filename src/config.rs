use dotenv::dotenv;
use std::env;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::backoff::BackoffSchedule;
use crate::error::{BridgeError, BridgeResult};

const SOCKET_URL: &str = "GO_QUEUE_WS_URL";
const PUBLISH_URL: &str = "GO_QUEUE_URL";
const REQUEST_TIMEOUT_MS: &str = "GO_QUEUE_REQUEST_TIMEOUT_MS";
const MAX_RECONNECT_ATTEMPTS: &str = "GO_QUEUE_MAX_RECONNECT_ATTEMPTS";
const BACKOFF_INITIAL_MS: &str = "GO_QUEUE_BACKOFF_INITIAL_MS";
const BACKOFF_MAX_MS: &str = "GO_QUEUE_BACKOFF_MAX_MS";
const BACKOFF_MULTIPLIER: &str = "GO_QUEUE_BACKOFF_MULTIPLIER";

pub const DEFAULT_PUBLISH_URL: &str = "http://localhost:8080/publish";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Endpoints and retry policy shared by the subscriber and the publisher.
///
/// Resolved once at startup and never mutated afterwards; both components take
/// what they need at construction.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    socket_url: Url,
    publish_url: Url,
    request_timeout: Duration,
    max_reconnect_attempts: u32,
    backoff: BackoffSchedule,
}

impl BridgeConfig {
    /// Creates a configuration for `socket_url` with defaults for everything else.
    pub fn new(socket_url: &str) -> BridgeResult<BridgeConfig> {
        Ok(BridgeConfig {
            socket_url: parse_url(SOCKET_URL, socket_url, &["ws", "wss"])?,
            publish_url: parse_url(PUBLISH_URL, DEFAULT_PUBLISH_URL, &["http", "https"])?,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: BackoffSchedule::default(),
        })
    }

    pub fn with_publish_url(mut self, publish_url: &str) -> BridgeResult<BridgeConfig> {
        self.publish_url = parse_url(PUBLISH_URL, publish_url, &["http", "https"])?;
        Ok(self)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> BridgeResult<BridgeConfig> {
        if timeout.is_zero() {
            return Err(BridgeError::Config(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        self.request_timeout = timeout;
        Ok(self)
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> BridgeResult<BridgeConfig> {
        if attempts == 0 {
            return Err(BridgeError::Config(
                "max reconnect attempts must be at least 1".to_string(),
            ));
        }
        self.max_reconnect_attempts = attempts;
        Ok(self)
    }

    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> BridgeResult<BridgeConfig> {
        backoff.validate().map_err(BridgeError::Config)?;
        self.backoff = backoff;
        Ok(self)
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }

    pub fn publish_url(&self) -> &Url {
        &self.publish_url
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    pub fn backoff(&self) -> BackoffSchedule {
        self.backoff
    }

    pub fn from_env() -> BridgeConfig {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_from_env() -> BridgeResult<BridgeConfig> {
        // Load .env file
        dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> BridgeResult<BridgeConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let socket_url = lookup(SOCKET_URL).ok_or_else(|| {
            BridgeError::Config(format!("failed to load environment variable {}", SOCKET_URL))
        })?;

        let mut config = BridgeConfig::new(socket_url.trim())?;

        match lookup(PUBLISH_URL) {
            Some(publish_url) => config = config.with_publish_url(publish_url.trim())?,
            None => info!(
                "{} not set, publishing to {}",
                PUBLISH_URL, DEFAULT_PUBLISH_URL
            ),
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, REQUEST_TIMEOUT_MS)? {
            config = config.with_request_timeout(Duration::from_millis(ms))?;
        }

        if let Some(attempts) = parse_var::<u32, _>(&lookup, MAX_RECONNECT_ATTEMPTS)? {
            config = config.with_max_reconnect_attempts(attempts)?;
        }

        let mut backoff = config.backoff;
        if let Some(ms) = parse_var::<u64, _>(&lookup, BACKOFF_INITIAL_MS)? {
            backoff.initial = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, BACKOFF_MAX_MS)? {
            backoff.max = Duration::from_millis(ms);
        }
        if let Some(multiplier) = parse_var::<f64, _>(&lookup, BACKOFF_MULTIPLIER)? {
            backoff.multiplier = multiplier;
        }

        config.with_backoff(backoff)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> BridgeResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| BridgeError::Config(format!("failed to parse {}: {}", key, raw))),
        None => Ok(None),
    }
}

fn parse_url(key: &str, raw: &str, schemes: &[&str]) -> BridgeResult<Url> {
    let url = Url::parse(raw)
        .map_err(|err| BridgeError::Config(format!("invalid {} '{}': {}", key, raw, err)))?;

    if !schemes.contains(&url.scheme()) {
        return Err(BridgeError::Config(format!(
            "{} must use one of {:?}, got '{}'",
            key,
            schemes,
            url.scheme()
        )));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_socket_url_is_set() {
        let config =
            BridgeConfig::from_lookup(lookup_from(&[(SOCKET_URL, "ws://go-queue-server:8080/ws")]))
                .unwrap();

        assert_eq!(config.socket_url().as_str(), "ws://go-queue-server:8080/ws");
        assert_eq!(config.publish_url().as_str(), DEFAULT_PUBLISH_URL);
        assert_eq!(config.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.max_reconnect_attempts(), DEFAULT_MAX_RECONNECT_ATTEMPTS);
        assert_eq!(config.backoff(), BackoffSchedule::default());
    }

    #[test]
    fn missing_socket_url_is_a_config_error() {
        let err = BridgeConfig::from_lookup(lookup_from(&[(PUBLISH_URL, "http://queue/publish")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(ref msg) if msg.contains(SOCKET_URL)));
    }

    #[test]
    fn every_variable_is_honoured() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            (SOCKET_URL, "wss://queue.internal/ws"),
            (PUBLISH_URL, "https://queue.internal/publish"),
            (REQUEST_TIMEOUT_MS, "250"),
            (MAX_RECONNECT_ATTEMPTS, "9"),
            (BACKOFF_INITIAL_MS, "20"),
            (BACKOFF_MAX_MS, "400"),
            (BACKOFF_MULTIPLIER, "3.0"),
        ]))
        .unwrap();

        assert_eq!(config.publish_url().as_str(), "https://queue.internal/publish");
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts(), 9);
        assert_eq!(config.backoff().initial, Duration::from_millis(20));
        assert_eq!(config.backoff().max, Duration::from_millis(400));
        assert_eq!(config.backoff().multiplier, 3.0);
    }

    #[test]
    fn unparseable_number_names_the_variable() {
        let err = BridgeConfig::from_lookup(lookup_from(&[
            (SOCKET_URL, "ws://localhost:8080/ws"),
            (MAX_RECONNECT_ATTEMPTS, "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BridgeError::Config(ref msg) if msg.contains(MAX_RECONNECT_ATTEMPTS)));
    }

    #[test]
    fn wrong_schemes_are_rejected() {
        assert!(BridgeConfig::new("http://localhost:8080/ws").is_err());
        assert!(
            BridgeConfig::new("ws://localhost:8080/ws")
                .unwrap()
                .with_publish_url("ws://localhost:8080/publish")
                .is_err()
        );
        assert!(BridgeConfig::new("not a url").is_err());
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = BridgeConfig::new("ws://localhost:8080/ws").unwrap();
        assert!(config.clone().with_request_timeout(Duration::ZERO).is_err());
        assert!(config.with_max_reconnect_attempts(0).is_err());
    }
}
