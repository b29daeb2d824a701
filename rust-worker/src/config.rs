//! Configuration module for environment variable parsing.
//!
//! Reads all configuration from environment variables. Broker credentials,
//! the two virtual hosts, the validator pool and the API key are required;
//! everything else has a default.

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::queue::BrokerSettings;

/// AMQP heartbeat negotiated with the broker, in seconds.
const BROKER_HEARTBEAT_SECS: u16 = 600;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Environment variable {0} must list at least one value")]
    EmptyList(&'static str),

    #[error("RABBITMQ_DEFAULT_VHOSTS must name a jobs vhost and a different results vhost, got {0:?}")]
    VhostPair(Vec<String>),
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// RabbitMQ host, used for both AMQP and the management API
    pub rabbitmq_host: String,

    /// AMQP port
    pub rabbitmq_port: u16,

    pub rabbitmq_username: String,

    pub rabbitmq_password: String,

    /// Virtual hosts: the first holds job queues, the second results queues
    pub rabbitmq_vhosts: Vec<String>,

    /// Management API queues endpoint, without the vhost segment
    pub rabbitmq_management_url: String,

    /// Base URLs of the validation workers, used round-robin
    pub validation_workers: Vec<String>,

    /// API key sent with every validation request
    pub validator_api_key: String,

    /// Messages pulled from each queue per round
    pub rows_per_round: usize,

    /// Target duration of one round, in seconds
    pub polling_interval_secs: u64,

    /// When set, the poll loop idles instead of draining queues
    pub pause: bool,

    /// Timeout for one validation request, in milliseconds
    pub validation_timeout_ms: u64,

    /// Optional uptime monitor URL pinged every polling interval
    pub uptime_monitor: Option<String>,

    /// Service label attached to every log line
    pub service_name: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let rabbitmq_host = required("RABBITMQ_HOST")?;

        let validation_workers = parse_csv(&lookup, "VALIDATION_WORKERS")
            .ok_or(ConfigError::Missing("VALIDATION_WORKERS"))?
            .into_iter()
            .map(|w| w.trim_end_matches('/').to_string())
            .collect::<Vec<_>>();
        if validation_workers.is_empty() {
            return Err(ConfigError::EmptyList("VALIDATION_WORKERS"));
        }

        // Results published into the jobs vhost would be discovered as job
        // queues on the next round
        let rabbitmq_vhosts = parse_csv(&lookup, "RABBITMQ_DEFAULT_VHOSTS")
            .ok_or(ConfigError::Missing("RABBITMQ_DEFAULT_VHOSTS"))?;
        match rabbitmq_vhosts.as_slice() {
            [jobs, results, ..] if jobs != results => {}
            _ => return Err(ConfigError::VhostPair(rabbitmq_vhosts)),
        }

        Ok(Config {
            rabbitmq_management_url: lookup("RABBITMQ_MANAGEMENT_URL")
                .unwrap_or_else(|| format!("https://{rabbitmq_host}/api/queues")),

            rabbitmq_port: parse_or(&lookup, "RABBITMQ_PORT", 5672),

            rabbitmq_username: required("RABBITMQ_USERNAME")?,

            rabbitmq_password: required("RABBITMQ_PASSWORD")?,

            rabbitmq_host,

            rabbitmq_vhosts,

            validation_workers,

            validator_api_key: required("VALIDATOR_API_KEY")?,

            rows_per_round: parse_or(&lookup, "ROWS_PER_ROUND", 10),

            polling_interval_secs: parse_or(&lookup, "POLLING_INTERVAL", 5),

            pause: parse_bool(&lookup, "PAUSE", false),

            validation_timeout_ms: parse_or(&lookup, "VALIDATION_TIMEOUT_MS", 30_000),

            uptime_monitor: lookup("UPTIME_MONITOR").filter(|v| !v.trim().is_empty()),

            service_name: lookup("SERVICE_NAME")
                .unwrap_or_else(|| "maillistshield-worker".to_string()),
        })
    }

    /// Virtual host holding the per-job queues.
    pub fn jobs_vhost(&self) -> &str {
        &self.rabbitmq_vhosts[0]
    }

    /// Virtual host results are published to. Always differs from the jobs vhost.
    pub fn results_vhost(&self) -> &str {
        &self.rabbitmq_vhosts[1]
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    pub fn broker_settings(&self, vhost: &str) -> BrokerSettings {
        BrokerSettings {
            host: self.rabbitmq_host.clone(),
            port: self.rabbitmq_port,
            username: self.rabbitmq_username.clone(),
            password: self.rabbitmq_password.clone(),
            vhost: vhost.to_string(),
            heartbeat: BROKER_HEARTBEAT_SECS,
        }
    }
}

/// Parse a value, warning and falling back to `default` when it is malformed.
fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(name) else {
        return default;
    };

    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

fn parse_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" | "t" => true,
        "0" | "false" | "no" | "off" | "n" | "f" | "" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv<F>(lookup: &F, name: &str) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("RABBITMQ_HOST", "rabbit.internal"),
        ("RABBITMQ_USERNAME", "worker"),
        ("RABBITMQ_PASSWORD", "secret"),
        ("VALIDATION_WORKERS", "http://v1:8000, http://v2:8000/"),
        ("VALIDATOR_API_KEY", "key-123"),
        ("RABBITMQ_DEFAULT_VHOSTS", "jobs,results"),
    ];

    fn with_vhosts(vhosts: &'static str) -> Vec<(&'static str, &'static str)> {
        let mut vars: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| *k != "RABBITMQ_DEFAULT_VHOSTS")
            .collect();
        vars.push(("RABBITMQ_DEFAULT_VHOSTS", vhosts));
        vars
    }

    #[test]
    fn test_defaults() {
        let config = load(REQUIRED).unwrap();

        assert_eq!(config.rabbitmq_port, 5672);
        assert_eq!(config.jobs_vhost(), "jobs");
        assert_eq!(config.results_vhost(), "results");
        assert_eq!(
            config.rabbitmq_management_url,
            "https://rabbit.internal/api/queues"
        );
        assert_eq!(
            config.validation_workers,
            vec!["http://v1:8000", "http://v2:8000"]
        );
        assert_eq!(config.rows_per_round, 10);
        assert_eq!(config.polling_interval(), Duration::from_secs(5));
        assert_eq!(config.validation_timeout(), Duration::from_secs(30));
        assert!(!config.pause);
        assert_eq!(config.uptime_monitor, None);
    }

    #[test]
    fn test_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("RABBITMQ_PORT", "5673"),
            ("ROWS_PER_ROUND", "25"),
            ("POLLING_INTERVAL", "2"),
            ("PAUSE", "True"),
            ("UPTIME_MONITOR", "https://uptime.example.com/ping/abc"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.jobs_vhost(), "jobs");
        assert_eq!(config.results_vhost(), "results");
        assert_eq!(config.rabbitmq_port, 5673);
        assert_eq!(config.rows_per_round, 25);
        assert_eq!(config.polling_interval(), Duration::from_secs(2));
        assert!(config.pause);
        assert_eq!(
            config.uptime_monitor.as_deref(),
            Some("https://uptime.example.com/ping/abc")
        );

        let settings = config.broker_settings(config.results_vhost());
        assert_eq!(settings.vhost, "results");
        assert_eq!(settings.port, 5673);
        assert_eq!(settings.heartbeat, 600);
    }

    #[test]
    fn test_default_vhost_can_hold_jobs() {
        let config = load(&with_vhosts("/, results")).unwrap();
        assert_eq!(config.jobs_vhost(), "/");
        assert_eq!(config.results_vhost(), "results");
    }

    #[test]
    fn test_results_vhost_must_differ_from_jobs_vhost() {
        assert_eq!(
            load(&with_vhosts("/")).unwrap_err(),
            ConfigError::VhostPair(vec!["/".to_string()])
        );
        assert_eq!(
            load(&with_vhosts("jobs,jobs")).unwrap_err(),
            ConfigError::VhostPair(vec!["jobs".to_string(), "jobs".to_string()])
        );
        assert_eq!(
            load(&with_vhosts(" , ")).unwrap_err(),
            ConfigError::VhostPair(Vec::new())
        );
    }

    #[test]
    fn test_missing_vhosts() {
        let vars: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| *k != "RABBITMQ_DEFAULT_VHOSTS")
            .collect();
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::Missing("RABBITMQ_DEFAULT_VHOSTS")
        );
    }

    #[test]
    fn test_invalid_number_falls_back_to_default() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ROWS_PER_ROUND", "lots"));
        assert_eq!(load(&vars).unwrap().rows_per_round, 10);
    }

    #[test]
    fn test_missing_required_value() {
        let vars: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| *k != "VALIDATOR_API_KEY")
            .collect();
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::Missing("VALIDATOR_API_KEY")
        );
    }

    #[test]
    fn test_empty_worker_list() {
        let mut vars: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| *k != "VALIDATION_WORKERS")
            .collect();
        vars.push(("VALIDATION_WORKERS", " , "));
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::EmptyList("VALIDATION_WORKERS")
        );
    }

    #[test]
    fn test_parse_csv() {
        let lookup = |_: &str| Some("foo, bar, ,baz".to_string());
        assert_eq!(
            parse_csv(&lookup, "ANY"),
            Some(vec!["foo".to_string(), "bar".to_string(), "baz".to_string()])
        );
    }
}
