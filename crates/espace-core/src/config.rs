//! Environment-variable backed configuration.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration in {variable}: {value}")]
    InvalidDuration { variable: String, value: String },

    #[error("invalid port in {variable}: {value}")]
    InvalidPort { variable: String, value: String },

    #[error("{variable} must be set when {dependent} is set")]
    MissingDependent { variable: String, dependent: String },
}

/// Configuration for the execution-space provider service.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Address to serve the API on.
    pub service_host: String,
    /// Port to serve the API on.
    pub service_port: u16,
    /// Maximum time for any single API request.
    pub request_timeout: Duration,
    /// Bound on the checkout fan-out.
    pub execution_space_wait_timeout: Duration,
    /// Cluster namespace test-runner workloads are created in.
    pub etos_namespace: String,
    /// `host:port` of the shared key-value store.
    pub database_endpoint: String,
    /// Externally reachable base URL of this provider, handed to the test
    /// controller as the executor callback host.
    pub provider_hostname: String,
    /// Base URL of the event repository.
    pub event_repository_url: String,
    /// AMQP broker URL for user-visible log lines, if remote logging is on.
    pub rabbitmq_url: Option<String>,
    /// Exchange to publish user-visible log lines to.
    pub rabbitmq_exchange: Option<String>,
    /// Encryption key handed to runners through the cluster secret.
    pub encryption_key: Option<String>,
}

impl ProviderConfig {
    /// Load the provider configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let rabbitmq_url = non_empty_env("ETOS_RABBITMQ_URL");
        let rabbitmq_exchange = non_empty_env("ETOS_RABBITMQ_EXCHANGE");
        if rabbitmq_url.is_some() && rabbitmq_exchange.is_none() {
            return Err(ConfigError::MissingDependent {
                variable: "ETOS_RABBITMQ_EXCHANGE".to_string(),
                dependent: "ETOS_RABBITMQ_URL".to_string(),
            });
        }

        Ok(Self {
            service_host: env_or_default("SERVICE_HOST", "127.0.0.1"),
            service_port: port_from_env("SERVICE_PORT", 8080)?,
            request_timeout: duration_from_env("REQUEST_TIMEOUT", Duration::from_secs(60))?,
            execution_space_wait_timeout: duration_from_env(
                "EXECUTION_SPACE_WAIT_TIMEOUT",
                Duration::from_secs(3600),
            )?,
            etos_namespace: namespace_or_env("ETOS_NAMESPACE"),
            database_endpoint: format!(
                "{}:{}",
                env_or_default("ETOS_ETCD_HOST", "etcd-client"),
                env_or_default("ETOS_ETCD_PORT", "2379"),
            ),
            provider_hostname: env_or_default("PROVIDER_HOSTNAME", "http://localhost"),
            event_repository_url: env_or_default("EIFFEL_GOER_URL", ""),
            rabbitmq_url,
            rabbitmq_exchange,
            encryption_key: non_empty_env("ETOS_ENCRYPTION_KEY"),
        })
    }
}

/// Configuration for the SSE log relay service.
#[derive(Debug, Clone)]
pub struct SseConfig {
    pub service_host: String,
    pub service_port: u16,
    /// Cluster namespace the test-runner workloads live in.
    pub etos_namespace: String,
}

impl SseConfig {
    /// Load the SSE relay configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            service_host: env_or_default("SERVICE_HOST", "127.0.0.1"),
            service_port: port_from_env("SERVICE_PORT", 8080)?,
            etos_namespace: namespace_or_env("ETOS_NAMESPACE"),
        })
    }
}

fn env_or_default(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// The in-cluster service-account namespace wins over the environment
/// variable when the process runs inside the cluster.
fn namespace_or_env(key: &str) -> String {
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|namespace| namespace.trim().to_string())
        .unwrap_or_else(|_| std::env::var(key).unwrap_or_default())
}

fn port_from_env(key: &str, fallback: u16) -> Result<u16, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(fallback),
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidPort {
            variable: key.to_string(),
            value,
        }),
    }
}

fn duration_from_env(key: &str, fallback: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(fallback),
        Ok(value) => parse_duration(&value).ok_or_else(|| ConfigError::InvalidDuration {
            variable: key.to_string(),
            value,
        }),
    }
}

/// Parse `300ms`, `30s`, `1m`, `2h` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix("ms") {
        return millis.parse().ok().map(Duration::from_millis);
    }
    if let Some(hours) = value.strip_suffix('h') {
        return hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600));
    }
    if let Some(minutes) = value.strip_suffix('m') {
        return minutes.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(seconds) = value.strip_suffix('s') {
        return seconds.parse().ok().map(Duration::from_secs);
    }
    value.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_suffixes() {
        assert_eq!(parse_duration("300ms"), Some(Duration::from_millis(300)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("1d"), None);
        assert_eq!(parse_duration(""), None);
    }
}
