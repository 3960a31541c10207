// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Preparer configuration: a TOML file, every field optional, with
//! command-line flags layered on top by the binary.

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

    #[error("no node name given (pass --node or set `node`)")]
    MissingNode,

    #[error("failed to read token file {path}")]
    Token {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct PreparerConfig {
    /// Name of this node; the key under the intent and reality trees.
    pub node: Option<String>,

    #[serde(default = "PreparerConfig::default_consul_address")]
    pub consul_address: String,

    /// File holding the KV ACL token, if any.
    pub consul_token_path: Option<Utf8PathBuf>,

    #[serde(default = "PreparerConfig::default_hooks_dir")]
    pub hooks_dir: Utf8PathBuf,

    #[serde(default = "PreparerConfig::default_pod_root")]
    pub pod_root: Utf8PathBuf,

    #[serde(default = "PreparerConfig::default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub launchables: stevedore_pod::LaunchableFlags,

    #[serde(default)]
    pub supervisor: stevedore_pod::supervisor::SupervisorConfig,

    /// TTL of the health session; a crashed preparer's health entries
    /// outlive it by at most this long.
    #[serde(default = "PreparerConfig::default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl PreparerConfig {
    fn default_consul_address() -> String {
        "127.0.0.1:8500".to_string()
    }

    fn default_hooks_dir() -> Utf8PathBuf {
        "/etc/stevedore/hooks".into()
    }

    fn default_pod_root() -> Utf8PathBuf {
        "/data/pods".into()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_session_ttl_secs() -> u64 {
        15
    }

    /// Load the file at `path`, or defaults when no file is given.
    pub fn load(path: Option<&Utf8Path>) -> Result<PreparerConfig, ConfigError> {
        let Some(path) = path else {
            return Ok(PreparerConfig::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Io { path: path.to_owned(), err }
        })?;
        toml::from_str(&raw)
            .map_err(|err| ConfigError::Parse { path: path.to_owned(), err })
    }

    /// Read the ACL token named by the config, trimming trailing
    /// whitespace.
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

impl Default for PreparerConfig {
    fn default() -> PreparerConfig {
        PreparerConfig {
            node: None,
            consul_address: Self::default_consul_address(),
            consul_token_path: None,
            hooks_dir: Self::default_hooks_dir(),
            pod_root: Self::default_pod_root(),
            log_level: Self::default_log_level(),
            launchables: Default::default(),
            supervisor: Default::default(),
            session_ttl_secs: Self::default_session_ttl_secs(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let config: PreparerConfig = toml::from_str(
            r#"
node = "n1"
consul_address = "10.0.0.5:8500"
pod_root = "/srv/pods"

[launchables]
enable_opencontainer = true
"#,
        )
        .unwrap();
        assert_eq!(config.node.as_deref(), Some("n1"));
        assert_eq!(config.consul_address, "10.0.0.5:8500");
        assert_eq!(config.pod_root, Utf8PathBuf::from("/srv/pods"));
        assert!(config.launchables.enable_opencontainer);
        assert_eq!(config.session_ttl_secs, 15);
    }
}
