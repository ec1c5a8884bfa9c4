//! Sync engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::sync::{BackoffPolicy, ConflictPolicies};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const MAX_RETRIES_ENV: &str = "FIELDSYNC_MAX_RETRIES";
const REQUEST_TIMEOUT_ENV: &str = "FIELDSYNC_REQUEST_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Attempts after which a transiently failing mutation is dead-lettered.
    pub max_retries: u32,
    /// Upper bound for every remote call.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub conflict_policies: ConflictPolicies,
    /// Start a drain after each local write while online.
    pub auto_sync_on_write: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            backoff: BackoffPolicy::default(),
            conflict_policies: ConflictPolicies::default(),
            auto_sync_on_write: true,
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `FIELDSYNC_MAX_RETRIES` and `FIELDSYNC_REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = read_var(&lookup, MAX_RETRIES_ENV) {
            let max_retries: u32 = parse_var(MAX_RETRIES_ENV, &value)?;
            if max_retries == 0 {
                return Err(Error::Config(format!("{} must be at least 1", MAX_RETRIES_ENV)));
            }
            self.max_retries = max_retries;
        }
        if let Some(value) = read_var(&lookup, REQUEST_TIMEOUT_ENV) {
            let secs: u64 = parse_var(REQUEST_TIMEOUT_ENV, &value)?;
            self.request_timeout = Duration::from_secs(secs.max(1));
        }
        Ok(self)
    }
}

fn read_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, value)))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_follow_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.auto_sync_on_write);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = SyncConfig::default()
            .with_overrides(lookup(&[
                (MAX_RETRIES_ENV, " 3 "),
                (REQUEST_TIMEOUT_ENV, "10"),
            ]))
            .unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_env_values_are_config_errors() {
        let err = SyncConfig::default()
            .with_overrides(lookup(&[(MAX_RETRIES_ENV, "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = SyncConfig::default()
            .with_overrides(lookup(&[(MAX_RETRIES_ENV, "0")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: SyncConfig =
            serde_json::from_str(r#"{ "maxRetries": 2, "requestTimeout": 5 }"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff, BackoffPolicy::default());
    }
}
