// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hoist launchables: gzipped tarballs with a `bin/` convention.
//!
//! The artifact's `bin/launch` is what runs under supervision: a lone
//! file is one service, a directory is one service per entry. The
//! optional `bin/post-activate`, `bin/enable`, and `bin/disable`
//! scripts hook the corresponding lifecycle steps. All paths handed to
//! the supervisor go through the `current` symlink so a flip is picked
//! up on the next restart.

use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{Logger, debug, info, o};
use stevedore_common::manifest::{
    CgroupConfig, LaunchableStanza, RestartPolicy,
};

use crate::execution::execute;
use crate::fetch::ArtifactFetcher;
use crate::launchable::{
    ControlError, Launchable, LaunchableError, artifact_version,
    extract_tar_gz, prune_installs, swap_current_symlink,
};
use crate::supervisor::{Executable, Service, ServiceBuilder};
use crate::users;

pub struct HoistLaunchable {
    id: String,
    location: String,
    version: String,
    run_as: String,
    root_dir: Utf8PathBuf,
    restart_policy: RestartPolicy,
    restart_timeout: Duration,
    cgroup: CgroupConfig,
    fetcher: ArtifactFetcher,
    log: Logger,
}

impl HoistLaunchable {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pod_id: &str,
        stanza_id: &str,
        stanza: &LaunchableStanza,
        run_as: &str,
        restart_policy: RestartPolicy,
        default_timeout: Duration,
        pod_home: &Utf8Path,
        fetcher: ArtifactFetcher,
        log: &Logger,
    ) -> Result<HoistLaunchable, LaunchableError> {
        let version = artifact_version(&stanza.location)?;
        let id = format!("{pod_id}__{stanza_id}");
        let restart_timeout = stanza
            .restart_timeout
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Ok(HoistLaunchable {
            log: log.new(o!("launchable" => id.clone())),
            id,
            location: stanza.location.clone(),
            version,
            run_as: run_as.to_string(),
            root_dir: pod_home.join(stanza_id),
            restart_policy,
            restart_timeout,
            cgroup: stanza.cgroup.clone(),
            fetcher,
        })
    }

    fn installs_dir(&self) -> Utf8PathBuf {
        self.root_dir.join("installs")
    }

    fn bin_path(&self, name: &str) -> Utf8PathBuf {
        self.current_dir().join("bin").join(name)
    }

    async fn run_bin_script(
        &self,
        name: &str,
    ) -> Result<Option<String>, crate::execution::ExecutionError> {
        let script = self.bin_path(name);
        if !script.exists() {
            return Ok(None);
        }
        let mut command = tokio::process::Command::new(&script);
        let output = execute(&mut command).await?;
        Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()))
    }
}

#[async_trait]
impl Launchable for HoistLaunchable {
    fn id(&self) -> &str {
        &self.id
    }

    fn user(&self) -> &str {
        &self.run_as
    }

    fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    fn restart_timeout(&self) -> Duration {
        self.restart_timeout
    }

    fn cgroup(&self) -> &CgroupConfig {
        &self.cgroup
    }

    fn root_dir(&self) -> &Utf8Path {
        &self.root_dir
    }

    fn install_dir(&self) -> Utf8PathBuf {
        self.installs_dir().join(&self.version)
    }

    async fn install(&self) -> Result<(), LaunchableError> {
        let install_dir = self.install_dir();
        if install_dir.exists() {
            debug!(self.log, "version already installed"; "version" => &self.version);
            return Ok(());
        }
        let (uid, gid) = users::ids(&self.run_as)?;
        users::mkdir_chown_all(&self.installs_dir(), uid, gid, 0o755)
            .await?;

        let archive = self.installs_dir().join(format!(
            "{}.tar.gz.partial",
            self.version
        ));
        self.fetcher.fetch_to(&self.location, &archive).await.map_err(
            |err| LaunchableError::Fetch {
                location: self.location.clone(),
                err,
            },
        )?;
        extract_tar_gz(&archive, &install_dir).await?;
        users::chown_recursive(&install_dir, uid, gid)?;
        if let Err(err) = tokio::fs::remove_file(&archive).await {
            debug!(
                self.log,
                "failed to remove staged archive";
                "path" => archive.as_str(),
                "error" => err.to_string(),
            );
        }
        info!(self.log, "installed artifact"; "version" => &self.version);
        Ok(())
    }

    async fn make_current(&self) -> Result<(), LaunchableError> {
        swap_current_symlink(&self.root_dir, &self.install_dir()).await
    }

    async fn post_activate(&self) -> Result<Option<String>, LaunchableError> {
        self.run_bin_script("post-activate").await.map_err(|err| {
            LaunchableError::PostActivate { id: self.id.clone(), err }
        })
    }

    async fn executables(
        &self,
        builder: &ServiceBuilder,
    ) -> Result<Vec<Executable>, LaunchableError> {
        let launch = self.bin_path("launch");
        let metadata = match tokio::fs::metadata(&launch).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(LaunchableError::Io { path: launch, err });
            }
        };

        if !metadata.is_dir() {
            let name = self.id.clone();
            return Ok(vec![Executable {
                service: Service {
                    path: builder.service_root().join(&name),
                    name,
                },
                exec: vec![launch.to_string()],
            }]);
        }

        let mut entries = Vec::new();
        let mut read_dir =
            tokio::fs::read_dir(&launch).await.map_err(|err| {
                LaunchableError::Io { path: launch.clone(), err }
            })?;
        while let Some(entry) =
            read_dir.next_entry().await.map_err(|err| LaunchableError::Io {
                path: launch.clone(),
                err,
            })?
        {
            if let Ok(file_name) = entry.file_name().into_string() {
                entries.push(file_name);
            }
        }
        entries.sort();

        Ok(entries
            .into_iter()
            .map(|entry| {
                let name = format!("{}__{}", self.id, entry);
                Executable {
                    service: Service {
                        path: builder.service_root().join(&name),
                        name,
                    },
                    exec: vec![launch.join(&entry).to_string()],
                }
            })
            .collect())
    }

    async fn enable(&self) -> Result<(), ControlError> {
        self.run_bin_script("enable").await.map(|_| ()).map_err(|err| {
            ControlError::Enable { service: self.id.clone(), err }
        })
    }

    async fn disable(&self) -> Result<(), ControlError> {
        self.run_bin_script("disable").await.map(|_| ()).map_err(|err| {
            ControlError::Disable { service: self.id.clone(), err }
        })
    }

    async fn prune(&self, max_bytes: u64) -> Result<(), LaunchableError> {
        prune_installs(&self.root_dir, max_bytes, &self.log).await
    }
}
