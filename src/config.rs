//! Provider configuration as a keyed string bag.
//!
//! The worker hands each backend a flat map of option names to string
//! values. Backends read what they understand, apply defaults, and write
//! resolved values back so later readers observe the same settings.

use std::collections::HashMap;

/// Flat option map shared between the worker and a backend.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProviderConfig {
    values: HashMap<String, String>,
}

impl ProviderConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from `(key, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Returns `true` when `key` has been set.
    #[must_use]
    pub fn is_set(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the value for `key`, if set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the value for `key`, or `default` when unset.
    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Removes `key` from the configuration.
    pub fn unset(&mut self, key: &str) {
        self.values.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_unset_round_trip() {
        let mut cfg = ProviderConfig::new();
        assert!(!cfg.is_set("ZONE"));
        assert_eq!(cfg.get("ZONE"), None);

        cfg.set("ZONE", "us-central1-a");
        assert!(cfg.is_set("ZONE"));
        assert_eq!(cfg.get("ZONE"), Some("us-central1-a"));

        cfg.unset("ZONE");
        assert!(!cfg.is_set("ZONE"));
    }

    #[test]
    fn get_or_falls_back_when_unset() {
        let cfg = ProviderConfig::from_pairs([("MACHINE_TYPE", "n1-highcpu-8")]);
        assert_eq!(cfg.get_or("MACHINE_TYPE", "n1-standard-2"), "n1-highcpu-8");
        assert_eq!(cfg.get_or("NETWORK", "default"), "default");
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut cfg = ProviderConfig::from_pairs([("DISK_SIZE", "20")]);
        cfg.set("DISK_SIZE", "40");
        assert_eq!(cfg.get("DISK_SIZE"), Some("40"));
    }
}
