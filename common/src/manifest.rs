// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pod manifests: the unit of intent in this system.
//!
//! A manifest is written once by an external planner and never mutated;
//! replacement is by overwrite. Identity is the *fingerprint*: a SHA-256
//! over the canonical YAML serialization. All maps in the model are
//! `BTreeMap` so that serialization order (and therefore the fingerprint)
//! is stable across processes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name of the file marking a pod as installed on a node.
pub const CURRENT_MANIFEST_FILENAME: &str = "current_manifest.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse manifest")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read manifest at {path}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },

    #[error("manifest has an empty id")]
    EmptyId,
}

/// How the supervisor treats a service that exits.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    Always,
    Never,
}

/// The kind of artifact a launchable stanza describes.
///
/// The stanza itself carries the raw tag so that a manifest with an
/// unrecognized type still parses; resolution to this enum happens when
/// the launchable is constructed, and that is where unknown tags fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchableType {
    Hoist,
    Opencontainer,
}

impl FromStr for LaunchableType {
    type Err = UnsupportedLaunchableType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hoist" => Ok(LaunchableType::Hoist),
            "opencontainer" => Ok(LaunchableType::Opencontainer),
            other => Err(UnsupportedLaunchableType(other.to_string())),
        }
    }
}

impl fmt::Display for LaunchableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchableType::Hoist => write!(f, "hoist"),
            LaunchableType::Opencontainer => write!(f, "opencontainer"),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("launchable type {0:?} is not supported")]
pub struct UnsupportedLaunchableType(pub String);

/// Resource limits applied to a launchable's cgroup.
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize,
)]
pub struct CgroupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u64>,
    /// Memory limit in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// One deployable artifact inside a pod.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaunchableStanza {
    /// Raw launchable type tag; see [`LaunchableType`].
    #[serde(rename = "type")]
    pub launchable_type: String,

    /// URL of the artifact to fetch.
    pub location: String,

    /// Where to fetch the artifact's content digest, if it is verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_location: Option<String>,

    /// Where to fetch the signature over the digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_signature_location: Option<String>,

    #[serde(default, skip_serializing_if = "CgroupConfig::is_empty")]
    pub cgroup: CgroupConfig,

    /// Seconds the supervisor waits for this launchable to stop or
    /// restart before giving up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_timeout: Option<u64>,
}

impl CgroupConfig {
    fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.memory.is_none()
    }
}

impl LaunchableStanza {
    /// Resolve the raw type tag, failing on anything unrecognized.
    pub fn launchable_type(
        &self,
    ) -> Result<LaunchableType, UnsupportedLaunchableType> {
        self.launchable_type.parse()
    }
}

/// Immutable-once-published description of a pod.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_as: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_port: Option<u16>,

    #[serde(default, skip_serializing_if = "is_default_restart_policy")]
    restart_policy: RestartPolicy,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    launchables: BTreeMap<String, LaunchableStanza>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    config: BTreeMap<String, serde_yaml::Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    platform_config: BTreeMap<String, serde_yaml::Value>,
}

fn is_default_restart_policy(policy: &RestartPolicy) -> bool {
    *policy == RestartPolicy::default()
}

impl Manifest {
    pub fn from_str(raw: &str) -> Result<Manifest, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(raw)?;
        if manifest.id.is_empty() {
            return Err(ManifestError::EmptyId);
        }
        Ok(manifest)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Manifest, ManifestError> {
        let manifest: Manifest = serde_yaml::from_slice(raw)?;
        if manifest.id.is_empty() {
            return Err(ManifestError::EmptyId);
        }
        Ok(manifest)
    }

    pub fn from_path<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Manifest, ManifestError> {
        let path = path.as_ref();
        let raw =
            std::fs::read_to_string(path).map_err(|err| ManifestError::Io {
                path: path.display().to_string(),
                err,
            })?;
        Manifest::from_str(&raw)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The user services in this pod run as. Defaults to the pod id when
    /// the manifest does not name one.
    pub fn run_as_user(&self) -> &str {
        self.run_as.as_deref().unwrap_or(&self.id)
    }

    pub fn status_port(&self) -> Option<u16> {
        self.status_port
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    pub fn launchables(&self) -> &BTreeMap<String, LaunchableStanza> {
        &self.launchables
    }

    pub fn config(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.config
    }

    pub fn platform_config(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.platform_config
    }

    /// Canonical YAML serialization. Fingerprints are computed over this
    /// form, and `to_yaml(parse(to_yaml(m)))` is byte-equal to
    /// `to_yaml(m)`.
    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Stable content hash of the canonical serialization.
    pub fn fingerprint(&self) -> Result<String, ManifestError> {
        let canonical = self.to_yaml()?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Name of the application-config file this manifest installs into a
    /// pod's `config/` directory.
    pub fn config_file_name(&self) -> Result<String, ManifestError> {
        Ok(format!("{}_{}.yaml", self.id, self.fingerprint()?))
    }

    /// Name of the platform-config counterpart.
    pub fn platform_config_file_name(&self) -> Result<String, ManifestError> {
        Ok(format!("{}_{}_platform.yaml", self.id, self.fingerprint()?))
    }

    pub fn write_config(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(&self.config)?)
    }

    pub fn write_platform_config(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(&self.platform_config)?)
    }
}

/// Builder for tests and external planners; the preparer itself only
/// ever consumes manifests.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    id: String,
    run_as: Option<String>,
    status_port: Option<u16>,
    restart_policy: RestartPolicy,
    launchables: BTreeMap<String, LaunchableStanza>,
    config: BTreeMap<String, serde_yaml::Value>,
    platform_config: BTreeMap<String, serde_yaml::Value>,
}

impl ManifestBuilder {
    pub fn new(id: &str) -> ManifestBuilder {
        ManifestBuilder { id: id.to_string(), ..Default::default() }
    }

    pub fn run_as(mut self, user: &str) -> ManifestBuilder {
        self.run_as = Some(user.to_string());
        self
    }

    pub fn status_port(mut self, port: u16) -> ManifestBuilder {
        self.status_port = Some(port);
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> ManifestBuilder {
        self.restart_policy = policy;
        self
    }

    pub fn launchable(
        mut self,
        id: &str,
        stanza: LaunchableStanza,
    ) -> ManifestBuilder {
        self.launchables.insert(id.to_string(), stanza);
        self
    }

    pub fn config_entry(
        mut self,
        key: &str,
        value: serde_yaml::Value,
    ) -> ManifestBuilder {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Manifest {
        Manifest {
            id: self.id,
            run_as: self.run_as,
            status_port: self.status_port,
            restart_policy: self.restart_policy,
            launchables: self.launchables,
            config: self.config,
            platform_config: self.platform_config,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hoist_stanza(location: &str) -> LaunchableStanza {
        LaunchableStanza {
            launchable_type: "hoist".to_string(),
            location: location.to_string(),
            digest_location: None,
            digest_signature_location: None,
            cgroup: CgroupConfig::default(),
            restart_timeout: None,
        }
    }

    #[test]
    fn test_round_trip_is_canonical() {
        let manifest = ManifestBuilder::new("web")
            .status_port(8080)
            .launchable("app", hoist_stanza("https://art.example/app.tar.gz"))
            .config_entry("greeting", serde_yaml::Value::from("hello"))
            .build();

        let once = manifest.to_yaml().unwrap();
        let reparsed = Manifest::from_str(&once).unwrap();
        let twice = reparsed.to_yaml().unwrap();
        assert_eq!(once, twice);
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let build = || {
            ManifestBuilder::new("web")
                .status_port(8080)
                .launchable(
                    "app",
                    hoist_stanza("https://art.example/app.tar.gz"),
                )
                .build()
        };
        assert_eq!(
            build().fingerprint().unwrap(),
            build().fingerprint().unwrap()
        );

        let other = ManifestBuilder::new("web")
            .status_port(8080)
            .launchable("app", hoist_stanza("https://art.example/app-v2.tar.gz"))
            .build();
        assert_ne!(
            build().fingerprint().unwrap(),
            other.fingerprint().unwrap()
        );
    }

    #[test]
    fn test_parses_wire_format() {
        let raw = r#"
id: web
run_as: deploy
status_port: 8080
launchables:
  app:
    type: hoist
    location: https://art.example/app.tar.gz
    digest_location: https://art.example/app.tar.gz.sha256
config:
  greeting: hello
"#;
        let manifest = Manifest::from_str(raw).unwrap();
        assert_eq!(manifest.id(), "web");
        assert_eq!(manifest.run_as_user(), "deploy");
        assert_eq!(manifest.status_port(), Some(8080));
        assert_eq!(manifest.restart_policy(), RestartPolicy::Always);
        let app = &manifest.launchables()["app"];
        assert_eq!(app.launchable_type().unwrap(), LaunchableType::Hoist);
        assert_eq!(
            app.digest_location.as_deref(),
            Some("https://art.example/app.tar.gz.sha256")
        );
    }

    #[test]
    fn test_run_as_defaults_to_pod_id() {
        let manifest = Manifest::from_str("id: web\n").unwrap();
        assert_eq!(manifest.run_as_user(), "web");
    }

    #[test]
    fn test_unknown_launchable_type_is_deferred() {
        // The manifest still parses; the bad tag surfaces when the
        // stanza is resolved.
        let raw = r#"
id: web
launchables:
  app:
    type: warp-drive
    location: https://art.example/app.tar.gz
"#;
        let manifest = Manifest::from_str(raw).unwrap();
        let err = manifest.launchables()["app"].launchable_type().unwrap_err();
        assert_eq!(err.0, "warp-drive");
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(matches!(
            Manifest::from_str("id: \"\"\n"),
            Err(ManifestError::EmptyId)
        ));
    }

    #[test]
    fn test_config_file_names_carry_fingerprint() {
        let manifest = ManifestBuilder::new("web").build();
        let fingerprint = manifest.fingerprint().unwrap();
        assert_eq!(
            manifest.config_file_name().unwrap(),
            format!("web_{fingerprint}.yaml")
        );
        assert_eq!(
            manifest.platform_config_file_name().unwrap(),
            format!("web_{fingerprint}_platform.yaml")
        );
    }
}
