use sha2::{Digest, Sha256};

use super::types::ClientConfig;

/// Number of hex characters kept from the config hash.
const HASHED_NAME_LEN: usize = 6;

/// Name a client is known by: its configured name, or a short hash of its
/// serialized config when no name was given.
///
/// The hash is stable for identical configs, so an unnamed client keeps the
/// same marker directory across restarts as long as its settings don't change.
pub fn client_name(config: &ClientConfig) -> String {
    if !config.name.is_empty() {
        return config.name.clone();
    }

    let serialized = serde_json::to_vec(config).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    let mut name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    name.truncate(HASHED_NAME_LEN);
    name
}

/// Name for a manager driving the given clients, e.g. `wal:default,backup`.
pub fn manager_name(client_names: &[String]) -> String {
    format!("wal:{}", client_names.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_name_wins() {
        let mut config = ClientConfig::new("http://localhost:3100/loki/api/v1/push");
        config.name = "primary".to_string();
        assert_eq!(client_name(&config), "primary");
    }

    #[test]
    fn test_hashed_name_is_stable() {
        let config = ClientConfig::new("http://localhost:3100/loki/api/v1/push");
        let first = client_name(&config);
        let second = client_name(&config.clone());

        assert_eq!(first, second);
        assert_eq!(first.len(), HASHED_NAME_LEN);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_configs_hash_differently() {
        let a = ClientConfig::new("http://a:3100/loki/api/v1/push");
        let b = ClientConfig::new("http://b:3100/loki/api/v1/push");
        assert_ne!(client_name(&a), client_name(&b));
    }

    #[test]
    fn test_manager_name() {
        let names = vec!["default".to_string(), "backup".to_string()];
        assert_eq!(manager_name(&names), "wal:default,backup");
    }
}
