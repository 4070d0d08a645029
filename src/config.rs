use std::{collections::HashSet, path::Path};

use http::Uri;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Environment variable carrying the serialized configuration into a worker process.
pub const WORKER_CONFIG_ENV: &str = "FLEET_WORKER_CONFIG";
/// Environment variable carrying the worker's id into a worker process.
pub const WORKER_ID_ENV: &str = "FLEET_WORKER_ID";

const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10_000;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub listen: u16,
    /// Defaults to the number of CPUs.
    pub workers: Option<usize>,
    /// random | round-robin | least-connections | ip-hash
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Master-side reply deadline. Absent means wait forever.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub id: String,
    /// Base URL, e.g. `http://localhost:8000`
    pub url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub path: String,
    /// Only the first id is used when routing.
    pub upstreams: Vec<String>,
}

fn default_algorithm() -> String {
    "random".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration for hand-off to a worker process.
    pub fn to_env_value(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a configuration handed over by the master. It was validated there.
    pub fn from_env_value(value: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(value)?)
    }

    pub fn worker_count(&self) -> usize {
        self.server.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen == 0 {
            return Err(ConfigError::Invalid("server.listen must be a non-zero port".into()));
        }

        if self.server.workers == Some(0) {
            return Err(ConfigError::Invalid("server.workers must be at least 1".into()));
        }

        let mut ids = HashSet::new();
        for upstream in &self.upstreams {
            if upstream.id.is_empty() {
                return Err(ConfigError::Invalid("upstream id is missing".into()));
            }
            if !ids.insert(upstream.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate upstream id '{}'",
                    upstream.id
                )));
            }

            let uri = upstream.url.parse::<Uri>().map_err(|e| {
                ConfigError::Invalid(format!("upstream '{}' has invalid url: {}", upstream.id, e))
            })?;
            if uri.scheme_str() != Some("http") || uri.authority().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "upstream '{}' url must be an absolute http:// URL",
                    upstream.id
                )));
            }
        }

        for rule in &self.rules {
            if !rule.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "rule path '{}' must start with '/'",
                    rule.path
                )));
            }
            if rule.upstreams.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "rule '{}' references no upstreams",
                    rule.path
                )));
            }
            // Routing reports these per request.
            for id in &rule.upstreams {
                if !ids.contains(id.as_str()) {
                    warn!("Rule '{}' references unknown upstream '{}'", rule.path, id);
                }
            }
            if rule.upstreams.len() > 1 {
                debug!(
                    "Rule '{}' lists {} upstreams; only '{}' is used",
                    rule.path,
                    rule.upstreams.len(),
                    rule.upstreams[0]
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  listen: 3000
  workers: 2
  algorithm: least-connections
upstreams:
  - id: todos
    url: http://localhost:8000
rules:
  - path: /todos
    upstreams: [todos]
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.server.listen, 3000);
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.server.algorithm, "least-connections");
        assert_eq!(config.server.request_timeout_ms, None);
        assert_eq!(config.server.upstream_timeout_ms, DEFAULT_UPSTREAM_TIMEOUT_MS);
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.rules[0].upstreams, vec!["todos".to_string()]);
    }

    #[test]
    fn worker_count_defaults_to_cpus() {
        let config = Config::from_yaml_str("server:\n  listen: 3000\n").unwrap();
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn rejects_zero_workers() {
        let err = Config::from_yaml_str("server:\n  listen: 3000\n  workers: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_duplicate_upstream_ids() {
        let yaml = r#"
server: { listen: 3000 }
upstreams:
  - { id: a, url: "http://localhost:1" }
  - { id: a, url: "http://localhost:2" }
"#;
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate upstream id"));
    }

    #[test]
    fn rejects_non_http_upstream_url() {
        let yaml = r#"
server: { listen: 3000 }
upstreams:
  - { id: a, url: "localhost:1" }
"#;
        assert!(Config::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn rejects_rule_without_upstreams() {
        let yaml = r#"
server: { listen: 3000 }
rules:
  - { path: /a, upstreams: [] }
"#;
        assert!(Config::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn dangling_upstream_reference_is_accepted() {
        let yaml = r#"
server: { listen: 3000 }
rules:
  - { path: /a, upstreams: [missing] }
"#;
        assert!(Config::from_yaml_str(yaml).is_ok());
    }

    #[test]
    fn env_value_round_trip_keeps_rules() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        let decoded = Config::from_env_value(&config.to_env_value().unwrap()).unwrap();
        assert_eq!(decoded.rules, config.rules);
        assert_eq!(decoded.upstreams, config.upstreams);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Config::from_file("/nonexistent/fleet.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
