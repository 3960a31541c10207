// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The launchable seam: one implementation per artifact kind.
//!
//! A launchable owns the subtree `<podHome>/<launchableId>/`:
//!
//! ```text
//! <launchableId>/
//!   installs/<version>/   one extracted artifact per version
//!   current -> installs/<version>
//!   env/LAUNCHABLE_ROOT
//! ```
//!
//! Install fetches and extracts; `make_current` atomically swaps the
//! `current` symlink; start/stop drive the supervisor over the
//! launchable's services. The trait carries default start/stop because
//! every kind talks to the supervisor the same way once its
//! executables are known.

use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use slog::{Logger, info, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::manifest::{
    CgroupConfig, RestartPolicy, UnsupportedLaunchableType,
};

use crate::execution::ExecutionError;
use crate::fetch::FetchError;
use crate::supervisor::{Executable, ServiceBuilder, Sv};
use crate::users::UserError;

#[derive(Debug, thiserror::Error)]
pub enum LaunchableError {
    #[error(transparent)]
    UnsupportedType(#[from] UnsupportedLaunchableType),

    #[error("cannot derive a version from artifact location {location:?}")]
    BadLocation { location: String },

    #[error("failed to fetch artifact from {location}")]
    Fetch {
        location: String,
        #[source]
        err: FetchError,
    },

    #[error("failed to unpack artifact into {dir}")]
    Extract {
        dir: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("OCI bundle at {0} has no config.json")]
    MissingBundleConfig(Utf8PathBuf),

    #[error("post-activate for {id} failed")]
    PostActivate {
        id: String,
        #[source]
        err: ExecutionError,
    },

    #[error("I/O failure on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(transparent)]
    User(#[from] UserError),
}

/// Service control failures, split by severity: enable/disable problems
/// are warnings, start/stop problems fail the transition.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("could not enable {service}")]
    Enable {
        service: String,
        #[source]
        err: ExecutionError,
    },

    #[error("could not disable {service}")]
    Disable {
        service: String,
        #[source]
        err: ExecutionError,
    },

    #[error("could not start {service}")]
    Start {
        service: String,
        #[source]
        err: ExecutionError,
    },

    #[error("could not stop {service}")]
    Stop {
        service: String,
        #[source]
        err: ExecutionError,
    },
}

impl ControlError {
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            ControlError::Enable { .. } | ControlError::Disable { .. }
        )
    }
}

/// Feature gating and tool locations for launchable construction,
/// carried in configuration rather than process-global state.
#[derive(Clone, Debug, Deserialize)]
pub struct LaunchableFlags {
    /// Permit `opencontainer` launchables. Off by default.
    #[serde(default)]
    pub enable_opencontainer: bool,

    /// OCI runtime binary used to run opencontainer bundles.
    #[serde(default = "LaunchableFlags::default_oci_runtime")]
    pub oci_runtime: Utf8PathBuf,
}

impl LaunchableFlags {
    fn default_oci_runtime() -> Utf8PathBuf {
        "/usr/bin/runc".into()
    }
}

impl Default for LaunchableFlags {
    fn default() -> LaunchableFlags {
        LaunchableFlags {
            enable_opencontainer: false,
            oci_runtime: Self::default_oci_runtime(),
        }
    }
}

#[async_trait]
pub trait Launchable: Send + Sync {
    /// Service-scoped id, `<podId>__<launchableId>`.
    fn id(&self) -> &str;

    fn user(&self) -> &str;

    fn restart_policy(&self) -> RestartPolicy;

    fn restart_timeout(&self) -> Duration;

    fn cgroup(&self) -> &CgroupConfig;

    fn root_dir(&self) -> &Utf8Path;

    /// Where this artifact version is (or will be) extracted.
    fn install_dir(&self) -> Utf8PathBuf;

    fn current_dir(&self) -> Utf8PathBuf {
        self.root_dir().join("current")
    }

    fn env_dir(&self) -> Utf8PathBuf {
        self.root_dir().join("env")
    }

    fn installed(&self) -> bool {
        self.install_dir().exists()
    }

    /// Fetch and extract the artifact. Idempotent: an already-installed
    /// version is left alone.
    async fn install(&self) -> Result<(), LaunchableError>;

    /// Atomically point `current` at the installed version.
    async fn make_current(&self) -> Result<(), LaunchableError>;

    /// Run the artifact's post-activate step, if it has one. Returns
    /// its output.
    async fn post_activate(&self) -> Result<Option<String>, LaunchableError>;

    /// The services this launchable contributes to the pod.
    async fn executables(
        &self,
        builder: &ServiceBuilder,
    ) -> Result<Vec<Executable>, LaunchableError>;

    async fn enable(&self) -> Result<(), ControlError>;

    async fn disable(&self) -> Result<(), ControlError>;

    async fn start(
        &self,
        execs: &[Executable],
        sv: &Sv,
    ) -> Result<(), ControlError> {
        for exec in execs {
            let result = match self.restart_policy() {
                RestartPolicy::Always => {
                    sv.restart(&exec.service.path, self.restart_timeout())
                        .await
                }
                RestartPolicy::Never => sv.once(&exec.service.path).await,
            };
            result.map_err(|err| ControlError::Start {
                service: exec.service.name.clone(),
                err,
            })?;
        }
        Ok(())
    }

    async fn stop(
        &self,
        execs: &[Executable],
        sv: &Sv,
    ) -> Result<(), ControlError> {
        for exec in execs {
            // A service dir the supervisor never saw is already
            // stopped.
            if !exec.service.path.exists() {
                continue;
            }
            sv.stop(&exec.service.path, self.restart_timeout())
                .await
                .map_err(|err| ControlError::Stop {
                    service: exec.service.name.clone(),
                    err,
                })?;
        }
        Ok(())
    }

    /// Trim old entries under `installs/`, never the current version.
    async fn prune(&self, max_bytes: u64) -> Result<(), LaunchableError>;
}

/// Derive an artifact version from its location: the basename with the
/// archive suffix stripped.
pub(crate) fn artifact_version(
    location: &str,
) -> Result<String, LaunchableError> {
    let basename = location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location);
    for suffix in [".tar.gz", ".tgz"] {
        if let Some(version) = basename.strip_suffix(suffix) {
            if !version.is_empty() {
                return Ok(version.to_string());
            }
        }
    }
    Err(LaunchableError::BadLocation { location: location.to_string() })
}

/// Extract a gzipped tarball into `dest`.
pub(crate) async fn extract_tar_gz(
    archive: &Utf8Path,
    dest: &Utf8Path,
) -> Result<(), LaunchableError> {
    let archive = archive.to_owned();
    let dest_owned = dest.to_owned();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive)?;
        let uncompressed =
            flate2::read::GzDecoder::new(std::io::BufReader::new(file));
        let mut unpacker = tar::Archive::new(uncompressed);
        unpacker.set_preserve_permissions(true);
        unpacker.unpack(&dest_owned)
    })
    .await
    .expect("extraction task does not panic")
    .map_err(|err| LaunchableError::Extract { dir: dest.to_owned(), err })
}

/// Swap `current` to point at `target` via a staged symlink and a
/// rename, so readers only ever observe the old or the new target. A
/// link that already points at `target` is left untouched.
pub(crate) async fn swap_current_symlink(
    root: &Utf8Path,
    target: &Utf8Path,
) -> Result<(), LaunchableError> {
    let current = root.join("current");
    if let Ok(existing) = tokio::fs::read_link(&current).await {
        if existing == target.as_std_path() {
            return Ok(());
        }
    }
    let staged = root.join("current.stage");
    match tokio::fs::remove_file(&staged).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(LaunchableError::Io { path: staged, err });
        }
    }
    tokio::fs::symlink(target, &staged).await.map_err(|err| {
        LaunchableError::Io { path: staged.clone(), err }
    })?;
    tokio::fs::rename(&staged, &current)
        .await
        .map_err(|err| LaunchableError::Io { path: current, err })?;
    Ok(())
}

/// Shared prune implementation: delete the oldest entries in
/// `installs/` once the newest ones exceed `max_bytes`, skipping the
/// version `current` points at.
pub(crate) async fn prune_installs(
    root: &Utf8Path,
    max_bytes: u64,
    log: &Logger,
) -> Result<(), LaunchableError> {
    let installs = root.join("installs");
    let current_target =
        tokio::fs::read_link(root.join("current")).await.ok();

    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(&installs).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(());
        }
        Err(err) => {
            return Err(LaunchableError::Io { path: installs, err });
        }
    };
    while let Some(entry) = read_dir.next_entry().await.map_err(|err| {
        LaunchableError::Io { path: installs.clone(), err }
    })? {
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        let modified =
            metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let size = dir_size(&path);
        entries.push((path, modified, size));
    }

    // Newest first; charge each version against the budget and drop
    // the ones past it.
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    let mut used = 0u64;
    for (path, _, size) in entries {
        if Some(path.as_path()) == current_target.as_deref() {
            continue;
        }
        used = used.saturating_add(size);
        if used > max_bytes {
            info!(
                log,
                "pruning old install";
                "path" => path.display().to_string(),
                "bytes" => size,
            );
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                warn!(
                    log,
                    "failed to prune install";
                    "path" => path.display().to_string(),
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
    }
    Ok(())
}

fn dir_size(path: &std::path::Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_artifact_version_from_location() {
        assert_eq!(
            artifact_version("https://art.example/web/app_1.2.3.tar.gz")
                .unwrap(),
            "app_1.2.3"
        );
        assert_eq!(
            artifact_version("https://art.example/app-v2.tgz").unwrap(),
            "app-v2"
        );
        assert!(matches!(
            artifact_version("https://art.example/app.zip"),
            Err(LaunchableError::BadLocation { .. })
        ));
    }
}
