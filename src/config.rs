//! Configuration management for Turnstile.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::RetryAfter;

/// Prefix for environment overrides, e.g. `TURNSTILE__RATE_LIMITING__LIMIT=10`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which admission algorithm backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    LeakyBucket,
    #[default]
    TokenBucket,
    /// Keyed fixed window that reports when to retry
    ExpiringFixedWindow,
}

/// Whether one limiter covers every caller or each client gets its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    #[default]
    PerClient,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub algorithm: Algorithm,

    #[serde(default)]
    pub scope: Scope,

    /// Requests per window (window algorithms)
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Window length in milliseconds (window algorithms)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Tokens added or water drained per second (bucket algorithms)
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket size (bucket algorithms)
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Idle time after which a client's state is dropped, and the sweep period
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Retry hint reported by the expiring fixed window
    #[serde(default)]
    pub retry_after: RetryAfter,

    /// Request path prefixes that bypass rate limiting
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            scope: Scope::default(),
            limit: default_limit(),
            window_ms: default_window_ms(),
            rate: default_rate(),
            capacity: default_capacity(),
            cleanup_interval_secs: default_cleanup_interval(),
            retry_after: RetryAfter::default(),
            exempt_paths: default_exempt_paths(),
        }
    }
}

fn default_limit() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_rate() -> f64 {
    2.0
}

fn default_capacity() -> u32 {
    5
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/healthz".to_string(), "/swagger/".to_string()]
}

impl RateLimitingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Reject settings no limiter could honor.
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            Algorithm::FixedWindow | Algorithm::SlidingWindow | Algorithm::ExpiringFixedWindow => {
                if self.limit == 0 {
                    return Err(TurnstileError::Config("limit must be greater than zero".into()));
                }
                if self.window_ms == 0 {
                    return Err(TurnstileError::Config("window_ms must be greater than zero".into()));
                }
                ensure_schedulable("window_ms", self.window())?;
            }
            Algorithm::LeakyBucket | Algorithm::TokenBucket => {
                if !self.rate.is_finite() || self.rate <= 0.0 {
                    return Err(TurnstileError::Config(format!(
                        "rate must be a finite number greater than zero, got {}",
                        self.rate
                    )));
                }
                if self.capacity == 0 {
                    return Err(TurnstileError::Config("capacity must be greater than zero".into()));
                }
                if Duration::try_from_secs_f64((self.capacity as f64 + 1.0) / self.rate).is_err() {
                    return Err(TurnstileError::Config(format!(
                        "rate {} is too slow for capacity {}",
                        self.rate, self.capacity
                    )));
                }
            }
        }

        if self.scope == Scope::PerClient {
            if self.cleanup_interval_secs == 0 {
                return Err(TurnstileError::Config(
                    "cleanup_interval_secs must be greater than zero".into(),
                ));
            }
            ensure_schedulable("cleanup_interval_secs", self.cleanup_interval())?;
        }

        if self.algorithm == Algorithm::ExpiringFixedWindow && self.scope == Scope::Global {
            return Err(TurnstileError::Config(
                "expiring_fixed_window only supports the per_client scope".into(),
            ));
        }

        Ok(())
    }
}

fn ensure_schedulable(field: &str, value: Duration) -> Result<()> {
    if Instant::now().checked_add(value).is_none() {
        return Err(TurnstileError::Config(format!("{} is too large", field)));
    }
    Ok(())
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `TURNSTILE__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`TurnstileConfig::load`], reading overrides from `env` instead of
    /// the process environment when given.
    fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("rate_limiting.exempt_paths")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        config.rate_limiting.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();

        assert_eq!(config.server.http_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.rate_limiting.algorithm, Algorithm::TokenBucket);
        assert_eq!(config.rate_limiting.scope, Scope::PerClient);
        assert_eq!(config.rate_limiting.capacity, 5);
        assert_eq!(config.rate_limiting.cleanup_interval(), Duration::from_secs(300));
        assert!(config.rate_limiting.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
rate_limiting:
  algorithm: sliding_window
  scope: global
  limit: 10
  window_ms: 1000
  exempt_paths: ["/docs/"]
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.rate_limiting.algorithm, Algorithm::SlidingWindow);
        assert_eq!(config.rate_limiting.scope, Scope::Global);
        assert_eq!(config.rate_limiting.window(), Duration::from_secs(1));
        assert_eq!(config.rate_limiting.exempt_paths, vec!["/docs/".to_string()]);
        // Unspecified fields fall back to defaults
        assert_eq!(config.rate_limiting.capacity, 5);
    }

    #[test]
    fn test_retry_after_policy_parsing() {
        let yaml = r#"
rate_limiting:
  algorithm: expiring_fixed_window
  retry_after: full_window
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limiting.retry_after, RetryAfter::FullWindow);
    }

    #[test]
    fn test_validation_rejects_zero_limit() {
        let yaml = r#"
rate_limiting:
  algorithm: fixed_window
  limit: 0
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_validation_rejects_non_positive_rate() {
        let mut config = RateLimitingConfig::default();
        config.rate = 0.0;
        assert!(config.validate().is_err());

        config.rate = 1.5;
        config.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_global_expiring_window() {
        let config = RateLimitingConfig {
            algorithm: Algorithm::ExpiringFixedWindow,
            scope: Scope::Global,
            ..RateLimitingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = TurnstileConfig::from_yaml("rate_limiting: [not, a, map]").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config.rate_limiting.limit, 100);
    }

    #[test]
    fn test_load_env_overrides_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "rate_limiting:\n  algorithm: fixed_window\n  limit: 10\n  window_ms: 1000\n",
        )
        .unwrap();

        let config = TurnstileConfig::load_with_env(
            Some(&path),
            env(&[
                ("TURNSTILE__RATE_LIMITING__LIMIT", "42"),
                ("TURNSTILE__RATE_LIMITING__EXEMPT_PATHS", "/docs/,/metrics"),
                ("TURNSTILE__SERVER__HTTP_ADDR", "0.0.0.0:9090"),
                ("UNRELATED", "ignored"),
            ]),
        );
        std::fs::remove_file(&path).unwrap();
        let config = config.unwrap();

        assert_eq!(config.rate_limiting.algorithm, Algorithm::FixedWindow);
        assert_eq!(config.rate_limiting.window(), Duration::from_secs(1));
        assert_eq!(config.rate_limiting.limit, 42);
        assert_eq!(
            config.rate_limiting.exempt_paths,
            vec!["/docs/".to_string(), "/metrics".to_string()]
        );
        assert_eq!(config.server.http_addr.port(), 9090);
    }

    #[test]
    fn test_load_env_values_are_validated() {
        let err = TurnstileConfig::load_with_env(
            None,
            env(&[("TURNSTILE__RATE_LIMITING__CAPACITY", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_validation_rejects_unschedulable_cleanup_interval() {
        let config = RateLimitingConfig {
            cleanup_interval_secs: u64::MAX,
            ..RateLimitingConfig::default()
        };
        assert!(config.validate().is_err());

        let global = RateLimitingConfig {
            scope: Scope::Global,
            cleanup_interval_secs: u64::MAX,
            ..RateLimitingConfig::default()
        };
        assert!(global.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_rate_too_slow_to_drain() {
        let config = RateLimitingConfig {
            algorithm: Algorithm::LeakyBucket,
            rate: 1e-20,
            ..RateLimitingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
