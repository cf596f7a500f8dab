use super::naming::client_name;
use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, ENV_VAR_PATTERN};
use regex::Regex;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parses and validates a config from YAML text.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    // Expand environment variables in the YAML string before parsing
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    config.wal.dir = expand_tilde(&config.wal.dir);

    validate_config(&config)?;
    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut unexpanded_vars: Vec<String> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.wal.dir.as_os_str().is_empty() {
        errors.push("wal.dir: must not be empty".to_string());
    }

    let watch = &config.wal.watch;
    if watch.min_read_frequency.is_zero() {
        errors.push("wal.watch.min_read_frequency: must be greater than zero".to_string());
    }
    if watch.min_read_frequency > watch.max_read_frequency {
        errors.push(format!(
            "wal.watch: min_read_frequency ({:?}) is greater than max_read_frequency ({:?})",
            watch.min_read_frequency, watch.max_read_frequency
        ));
    }

    if config.clients.is_empty() {
        errors.push("clients: at least one client must be configured".to_string());
    }

    let mut seen_names = HashSet::new();
    for (index, client) in config.clients.iter().enumerate() {
        let name = client_name(client);
        let context = format!("clients[{}] ('{}')", index, name);

        if !seen_names.insert(name.clone()) {
            errors.push(format!("{}: duplicate client name '{}'", context, name));
        }
        validate_client(&context, client, &mut errors);
    }

    if let Some(metrics) = &config.metrics {
        if metrics.listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "metrics.listen: '{}' is not a valid socket address",
                metrics.listen
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_client(context: &str, client: &ClientConfig, errors: &mut Vec<String>) {
    match reqwest::Url::parse(&client.url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(format!(
            "{}: url scheme '{}' is not supported, use http or https",
            context,
            url.scheme()
        )),
        Err(e) => errors.push(format!("{}: invalid url '{}': {}", context, client.url, e)),
    }

    if client.batch_size == 0 {
        errors.push(format!("{}: batch_size must be greater than zero", context));
    }
    if client.batch_wait.is_zero() {
        errors.push(format!("{}: batch_wait must be greater than zero", context));
    }
    if client.timeout.is_zero() {
        errors.push(format!("{}: timeout must be greater than zero", context));
    }
    if client.backoff.min_period > client.backoff.max_period {
        errors.push(format!(
            "{}: backoff.min_period ({:?}) is greater than backoff.max_period ({:?})",
            context, client.backoff.min_period, client.backoff.max_period
        ));
    }
    if client.queue.capacity == 0 {
        errors.push(format!("{}: queue.capacity must be greater than zero", context));
    }

    for name in client.headers.keys() {
        if reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(format!("{}: invalid header name '{}'", context, name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MINIMAL: &str = r#"
wal:
  dir: /var/lib/logship/wal
clients:
  - url: http://localhost:3100/loki/api/v1/push
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();

        assert_eq!(config.wal.watch.min_read_frequency, Duration::from_millis(250));
        assert_eq!(config.wal.watch.max_read_frequency, Duration::from_secs(1));
        assert_eq!(config.wal.watch.drain_timeout, Duration::from_secs(15));
        assert!(!config.wal.drain_on_shutdown);

        let client = &config.clients[0];
        assert_eq!(client.batch_wait, Duration::from_secs(1));
        assert_eq!(client.batch_size, 1024 * 1024);
        assert_eq!(client.timeout, Duration::from_secs(10));
        assert_eq!(client.backoff.min_period, Duration::from_millis(500));
        assert_eq!(client.backoff.max_period, Duration::from_secs(300));
        assert_eq!(client.backoff.max_retries, 10);
        assert_eq!(config.limits, LimitsConfig::default());
        assert!(config.metrics.is_none());
    }

    #[test]
    fn test_durations_parse_humantime() {
        let yaml = r#"
wal:
  dir: /tmp/wal
  watch:
    min_read_frequency: 10ms
    max_read_frequency: 2s
clients:
  - url: http://localhost:3100/loki/api/v1/push
    batch_wait: 500ms
    backoff:
      min_period: 100ms
      max_period: 1m
      max_retries: 0
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.wal.watch.min_read_frequency, Duration::from_millis(10));
        assert_eq!(config.clients[0].batch_wait, Duration::from_millis(500));
        assert_eq!(config.clients[0].backoff.max_period, Duration::from_secs(60));
        assert_eq!(config.clients[0].backoff.max_retries, 0);
    }

    #[test]
    fn test_no_clients_rejected() {
        let yaml = "wal:\n  dir: /tmp/wal\nclients: []\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("at least one client"));
    }

    #[test]
    fn test_duplicate_client_names_rejected() {
        let yaml = r#"
wal:
  dir: /tmp/wal
clients:
  - name: loki
    url: http://a:3100/loki/api/v1/push
  - name: loki
    url: http://b:3100/loki/api/v1/push
"#;
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate client name 'loki'"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
wal:
  dir: /tmp/wal
  watch:
    min_read_frequency: 2s
    max_read_frequency: 1s
clients:
  - url: not a url
    batch_size: 0
"#;
        match parse_config(yaml).unwrap_err() {
            ConfigError::ValidationList(errors) => {
                assert_eq!(errors.len(), 3, "{:?}", errors);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unexpanded_env_var_rejected() {
        let yaml = "wal:\n  dir: $env{LOGSHIP_TEST_SURELY_UNSET}\nclients: []\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("LOGSHIP_TEST_SURELY_UNSET"));
    }
}
