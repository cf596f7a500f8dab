pub mod generate;
pub mod naming;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use naming::{client_name, manager_name};
pub use parse::{load_config, parse_config, ConfigError};
pub use types::{
    BackoffConfig, ClientConfig, Config, LimitsConfig, MetricsConfig, QueueConfig, WalConfig,
    WatchConfig,
};

/// `$env{VAR_NAME}` where VAR_NAME starts with a letter or underscore.
pub(crate) const ENV_VAR_PATTERN: &str = r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}";

fn env_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ENV_VAR_PATTERN).expect("env var pattern is a valid regex"))
}

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    env_var_regex()
        .replace_all(text, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string()
}

/// Expands tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path based on explicit argument or default locations.
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/logship/config.yml
/// 3. /etc/logship/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/logship/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/logship/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_expand_env_vars_single() {
        std::env::set_var("LOGSHIP_TEST_TENANT", "team-a");
        let result = expand_env_vars("tenant_id: $env{LOGSHIP_TEST_TENANT}");
        assert_eq!(result, "tenant_id: team-a");
        std::env::remove_var("LOGSHIP_TEST_TENANT");
    }

    #[test]
    fn test_expand_env_vars_partial() {
        std::env::set_var("LOGSHIP_TEST_HOST", "loki");
        let result = expand_env_vars("http://$env{LOGSHIP_TEST_HOST}:$env{LOGSHIP_TEST_UNSET_PORT}");
        assert_eq!(result, "http://loki:$env{LOGSHIP_TEST_UNSET_PORT}");
        std::env::remove_var("LOGSHIP_TEST_HOST");
    }

    #[test]
    fn test_expand_env_vars_no_expansion() {
        assert_eq!(expand_env_vars("plain ${not_env}"), "plain ${not_env}");
    }

    #[test]
    fn test_expand_tilde_with_path() {
        let expanded = expand_tilde(Path::new("~/wal"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("wal"));
        }
    }

    #[test]
    fn test_expand_tilde_no_expansion() {
        assert_eq!(expand_tilde(Path::new("/var/wal")), Path::new("/var/wal"));
        assert_eq!(expand_tilde(Path::new("wal/~")), Path::new("wal/~"));
    }
}
