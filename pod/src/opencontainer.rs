// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Opencontainer launchables: OCI bundles run through an external
//! runtime.
//!
//! The artifact is still a gzipped tarball, but its contents are an
//! OCI bundle whose `config.json` defines the process; supervision
//! wraps a single `<runtime> run` invocation per launchable. There are
//! no lifecycle scripts; the bundle's config is the whole contract.

use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{Logger, debug, info, o};
use stevedore_common::manifest::{
    CgroupConfig, LaunchableStanza, RestartPolicy,
};

use crate::fetch::ArtifactFetcher;
use crate::launchable::{
    ControlError, Launchable, LaunchableError, artifact_version,
    extract_tar_gz, prune_installs, swap_current_symlink,
};
use crate::supervisor::{Executable, Service, ServiceBuilder};
use crate::users;

pub struct OpencontainerLaunchable {
    id: String,
    location: String,
    version: String,
    run_as: String,
    root_dir: Utf8PathBuf,
    restart_policy: RestartPolicy,
    restart_timeout: Duration,
    cgroup: CgroupConfig,
    runtime_bin: Utf8PathBuf,
    fetcher: ArtifactFetcher,
    log: Logger,
}

impl OpencontainerLaunchable {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pod_id: &str,
        stanza_id: &str,
        stanza: &LaunchableStanza,
        run_as: &str,
        restart_policy: RestartPolicy,
        default_timeout: Duration,
        pod_home: &Utf8Path,
        runtime_bin: Utf8PathBuf,
        fetcher: ArtifactFetcher,
        log: &Logger,
    ) -> Result<OpencontainerLaunchable, LaunchableError> {
        let version = artifact_version(&stanza.location)?;
        let id = format!("{pod_id}__{stanza_id}");
        let restart_timeout = stanza
            .restart_timeout
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Ok(OpencontainerLaunchable {
            log: log.new(o!("launchable" => id.clone())),
            id,
            location: stanza.location.clone(),
            version,
            run_as: run_as.to_string(),
            root_dir: pod_home.join(stanza_id),
            restart_policy,
            restart_timeout,
            cgroup: stanza.cgroup.clone(),
            runtime_bin,
            fetcher,
        })
    }

    fn installs_dir(&self) -> Utf8PathBuf {
        self.root_dir.join("installs")
    }
}

#[async_trait]
impl Launchable for OpencontainerLaunchable {
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

        // A bundle without config.json cannot be run; fail the install
        // rather than handing the supervisor a service that can never
        // start.
        if !install_dir.join("config.json").exists() {
            return Err(LaunchableError::MissingBundleConfig(install_dir));
        }

        users::chown_recursive(&install_dir, uid, gid)?;
        if let Err(err) = tokio::fs::remove_file(&archive).await {
            debug!(
                self.log,
                "failed to remove staged archive";
                "path" => archive.as_str(),
                "error" => err.to_string(),
            );
        }
        info!(self.log, "installed bundle"; "version" => &self.version);
        Ok(())
    }

    async fn make_current(&self) -> Result<(), LaunchableError> {
        swap_current_symlink(&self.root_dir, &self.install_dir()).await
    }

    async fn post_activate(&self) -> Result<Option<String>, LaunchableError> {
        Ok(None)
    }

    async fn executables(
        &self,
        builder: &ServiceBuilder,
    ) -> Result<Vec<Executable>, LaunchableError> {
        if !self.current_dir().exists() {
            return Ok(Vec::new());
        }
        let name = self.id.clone();
        Ok(vec![Executable {
            service: Service {
                path: builder.service_root().join(&name),
                name: name.clone(),
            },
            exec: vec![
                self.runtime_bin.to_string(),
                "run".to_string(),
                "--bundle".to_string(),
                self.current_dir().to_string(),
                name,
            ],
        }])
    }

    async fn enable(&self) -> Result<(), ControlError> {
        Ok(())
    }

    async fn disable(&self) -> Result<(), ControlError> {
        Ok(())
    }

    async fn prune(&self, max_bytes: u64) -> Result<(), LaunchableError> {
        prune_installs(&self.root_dir, max_bytes, &self.log).await
    }
}
