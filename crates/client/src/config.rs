//! Process configuration read from the environment.

use fieldsync_core::config::SyncConfig;
use fieldsync_core::errors::{Error, Result};

const DATA_DIR_ENV: &str = "FIELDSYNC_DATA_DIR";
const API_URL_ENV: &str = "FIELDSYNC_API_URL";
const DEFAULT_DATA_DIR: &str = "./fieldsync-data";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Directory holding the local database.
    pub data_dir: String,
    /// Base URL of the remote entity API, without trailing slash.
    pub api_base_url: String,
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn new(data_dir: impl Into<String>, api_base_url: &str) -> Self {
        Self {
            data_dir: data_dir.into(),
            api_base_url: api_base_url.trim().trim_end_matches('/').to_string(),
            sync: SyncConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok()).and_then(|mut config| {
            config.sync = SyncConfig::from_env()?;
            Ok(config)
        })
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_base_url = lookup(API_URL_ENV)
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::Config(format!("{} is not set", API_URL_ENV)))?;
        let data_dir = lookup(DATA_DIR_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());

        Ok(Self {
            data_dir,
            api_base_url,
            sync: SyncConfig::default(),
        })
    }
}
