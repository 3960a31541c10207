// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Roll farm configuration.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },

    #[error("failed to read token file {path}")]
    Token {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct FarmConfig {
    #[serde(default = "FarmConfig::default_consul_address")]
    pub consul_address: String,

    pub consul_token_path: Option<Utf8PathBuf>,

    #[serde(default = "FarmConfig::default_log_level")]
    pub log_level: String,

    #[serde(default = "FarmConfig::default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl FarmConfig {
    fn default_consul_address() -> String {
        "127.0.0.1:8500".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_session_ttl_secs() -> u64 {
        15
    }

    pub fn load(path: Option<&Utf8Path>) -> Result<FarmConfig, ConfigError> {
        let Some(path) = path else {
            return Ok(FarmConfig::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Io { path: path.to_owned(), err }
        })?;
        toml::from_str(&raw)
            .map_err(|err| ConfigError::Parse { path: path.to_owned(), err })
    }

    pub fn read_token(&self) -> Result<Option<String>, ConfigError> {
        let Some(path) = &self.consul_token_path else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Token { path: path.clone(), err }
        })?;
        Ok(Some(raw.trim().to_string()))
    }
}

impl Default for FarmConfig {
    fn default() -> FarmConfig {
        FarmConfig {
            consul_address: Self::default_consul_address(),
            consul_token_path: None,
            log_level: Self::default_log_level(),
            session_ttl_secs: Self::default_session_ttl_secs(),
        }
    }
}
