//! Environment-driven settings.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use docflow_core::RetryPolicy;

use crate::extraction::DEFAULT_MAX_INPUT_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} is invalid: {message}")]
    Invalid { var: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// `None` runs the in-memory broker.
    pub redis_url: Option<String>,
    pub stream: String,
    pub group: String,
    pub visibility_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: usize,
    pub retry: RetryPolicy,
    pub claim_lease: Duration,
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub timeout: Duration,
    pub max_input_bytes: usize,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    /// `None` logs notifications instead of sending them.
    pub webhook_url: Option<String>,
    pub max_attempts: u32,
}

/// Everything the `docflow` binary needs to start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    /// `None` runs the in-memory job store.
    pub database_url: Option<String>,
    pub blob_dir: PathBuf,
    pub broker: BrokerSettings,
    pub workers: WorkerSettings,
    pub extraction: ExtractionSettings,
    pub notify: NotifySettings,
    pub shutdown_grace: Duration,
    pub pending_recovery: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build settings from any variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let max_attempts: u32 = env.parse("JOB_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "JOB_MAX_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }
        let retry = RetryPolicy::exponential(
            max_attempts,
            Duration::from_millis(env.parse("JOB_BACKOFF_BASE_MS", 500)?),
            Duration::from_millis(env.parse("JOB_BACKOFF_MAX_MS", 60_000)?),
        );

        let claim_lease = Duration::from_secs(env.parse("JOB_CLAIM_LEASE_SECS", 300)?);
        let extraction_timeout = Duration::from_secs(env.parse("EXTRACTION_TIMEOUT_SECS", 60)?);
        // A claim must outlive one engine call plus the output write, or a
        // live worker can look abandoned.
        if claim_lease <= extraction_timeout {
            return Err(ConfigError::Invalid {
                var: "JOB_CLAIM_LEASE_SECS",
                message: format!(
                    "{}s must be longer than EXTRACTION_TIMEOUT_SECS ({}s)",
                    claim_lease.as_secs(),
                    extraction_timeout.as_secs()
                ),
            });
        }

        Ok(Self {
            bind_addr: env.parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            jwt_secret: env.get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?,
            database_url: env.get("DATABASE_URL"),
            blob_dir: env.get("BLOB_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./data/blobs")),
            broker: BrokerSettings {
                redis_url: env.get("REDIS_URL"),
                stream: env.get("BROKER_STREAM").unwrap_or_else(|| "docflow:jobs".to_string()),
                group: env.get("BROKER_GROUP").unwrap_or_else(|| "docflow-workers".to_string()),
                visibility_timeout: Duration::from_millis(env.parse("BROKER_VISIBILITY_TIMEOUT_MS", 300_000)?),
            },
            workers: WorkerSettings {
                count: env.parse::<usize>("WORKER_COUNT", 4)?.max(1),
                retry,
                claim_lease,
            },
            extraction: ExtractionSettings {
                timeout: extraction_timeout,
                max_input_bytes: env.parse("EXTRACTION_MAX_INPUT_BYTES", DEFAULT_MAX_INPUT_BYTES)?,
                base_url: env
                    .get("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key: env.get("OPENAI_API_KEY"),
                model: env.get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            },
            notify: NotifySettings {
                webhook_url: env.get("NOTIFY_WEBHOOK_URL"),
                max_attempts: env.parse("NOTIFY_MAX_ATTEMPTS", 3)?,
            },
            shutdown_grace: Duration::from_secs(env.parse("SHUTDOWN_GRACE_SECS", 30)?),
            pending_recovery: Duration::from_secs(env.parse("PENDING_RECOVERY_SECS", 60)?),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                message: format!("{raw:?}: {e}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_need_only_a_secret() {
        let s = settings(&[("JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(s.bind_addr.port(), 8080);
        assert_eq!(s.database_url, None);
        assert_eq!(s.broker.redis_url, None);
        assert_eq!(s.broker.stream, "docflow:jobs");
        assert_eq!(s.workers.count, 4);
        assert_eq!(s.workers.retry.max_attempts, 5);
        assert_eq!(s.workers.claim_lease, Duration::from_secs(300));
        assert_eq!(s.extraction.max_input_bytes, 10 * 1024 * 1024);
        assert_eq!(s.notify.webhook_url, None);
    }

    #[test]
    fn missing_secret_is_an_error() {
        assert_eq!(settings(&[]).unwrap_err(), ConfigError::Missing("JWT_SECRET"));
        assert_eq!(settings(&[("JWT_SECRET", "  ")]).unwrap_err(), ConfigError::Missing("JWT_SECRET"));
    }

    #[test]
    fn bad_numbers_are_rejected_not_defaulted() {
        let err = settings(&[("JWT_SECRET", "s"), ("WORKER_COUNT", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WORKER_COUNT", .. }));

        let err = settings(&[("JWT_SECRET", "s"), ("JOB_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn claim_lease_must_outlast_the_extraction_timeout() {
        let err = settings(&[("JWT_SECRET", "s"), ("JOB_CLAIM_LEASE_SECS", "1")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_CLAIM_LEASE_SECS", .. }));

        let err = settings(&[
            ("JWT_SECRET", "s"),
            ("JOB_CLAIM_LEASE_SECS", "60"),
            ("EXTRACTION_TIMEOUT_SECS", "60"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_CLAIM_LEASE_SECS", .. }));

        let s = settings(&[
            ("JWT_SECRET", "s"),
            ("JOB_CLAIM_LEASE_SECS", "30"),
            ("EXTRACTION_TIMEOUT_SECS", "10"),
        ])
        .unwrap();
        assert_eq!(s.workers.claim_lease, Duration::from_secs(30));
        assert_eq!(s.extraction.timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_apply() {
        let s = settings(&[
            ("JWT_SECRET", "s"),
            ("DATABASE_URL", "postgres://localhost/docflow"),
            ("WORKER_COUNT", "0"),
            ("JOB_BACKOFF_BASE_MS", "10"),
            ("NOTIFY_WEBHOOK_URL", "http://hooks.local/done"),
        ])
        .unwrap();
        assert_eq!(s.database_url.as_deref(), Some("postgres://localhost/docflow"));
        assert_eq!(s.workers.count, 1);
        assert_eq!(s.workers.retry.base_delay, Duration::from_millis(10));
        assert_eq!(s.notify.webhook_url.as_deref(), Some("http://hooks.local/done"));
    }
}
