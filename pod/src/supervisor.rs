// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration with the external runit-style service supervisor.
//!
//! Supervision itself is out of our hands; what this module owns is the
//! supervisor's *input*: one YAML file per pod under `config_root`
//! describing that pod's services, and the materialized service
//! directories under `service_root` (each holding a `run` script, plus
//! a `down` file when the service should not be auto-restarted). The
//! [`Sv`] wrapper shells out to the supervisor's control tool for
//! start/stop transitions.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use stevedore_common::manifest::RestartPolicy;

use crate::execution::{ExecutionError, execute};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("I/O failure on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to encode supervisor config at {path}")]
    Serialize {
        path: Utf8PathBuf,
        #[source]
        err: serde_yaml::Error,
    },

    #[error("failed to decode supervisor config at {path}")]
    Deserialize {
        path: Utf8PathBuf,
        #[source]
        err: serde_yaml::Error,
    },
}

/// Configuration for where supervisor inputs live on this host.
#[derive(Clone, Debug, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "SupervisorConfig::default_config_root")]
    pub config_root: Utf8PathBuf,
    #[serde(default = "SupervisorConfig::default_service_root")]
    pub service_root: Utf8PathBuf,
    #[serde(default = "SupervisorConfig::default_sv_bin")]
    pub sv_bin: Utf8PathBuf,
    #[serde(default = "SupervisorConfig::default_chpst_bin")]
    pub chpst_bin: Utf8PathBuf,
}

impl SupervisorConfig {
    fn default_config_root() -> Utf8PathBuf {
        "/etc/servicebuilder.d".into()
    }
    fn default_service_root() -> Utf8PathBuf {
        "/var/service".into()
    }
    fn default_sv_bin() -> Utf8PathBuf {
        "/usr/bin/sv".into()
    }
    fn default_chpst_bin() -> Utf8PathBuf {
        "/usr/bin/chpst".into()
    }
}

impl Default for SupervisorConfig {
    fn default() -> SupervisorConfig {
        SupervisorConfig {
            config_root: Self::default_config_root(),
            service_root: Self::default_service_root(),
            sv_bin: Self::default_sv_bin(),
            chpst_bin: Self::default_chpst_bin(),
        }
    }
}

/// One supervised service: its name and its directory under the
/// supervisor's service root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub path: Utf8PathBuf,
}

/// A service plus the argv that runs it; what a launchable contributes
/// to its pod's supervisor config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Executable {
    pub service: Service,
    pub exec: Vec<String>,
}

/// Cgroup scope rendered into a service's supervisor config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateCgroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// Everything the supervisor needs to run one service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub run: Vec<String>,
    pub user: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_dirs: Vec<Utf8PathBuf>,
    /// True when the service must not be restarted automatically; the
    /// supervisor convention is a `down` file in the service dir.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub down: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<TemplateCgroup>,
}

/// Renders per-pod service config and materializes service directories.
#[derive(Clone, Debug)]
pub struct ServiceBuilder {
    config_root: Utf8PathBuf,
    service_root: Utf8PathBuf,
    chpst_bin: Utf8PathBuf,
    log: Logger,
}

impl ServiceBuilder {
    pub fn new(config: &SupervisorConfig, log: &Logger) -> ServiceBuilder {
        ServiceBuilder {
            config_root: config.config_root.clone(),
            service_root: config.service_root.clone(),
            chpst_bin: config.chpst_bin.clone(),
            log: log.new(o!("component" => "ServiceBuilder")),
        }
    }

    pub fn service_root(&self) -> &Utf8Path {
        &self.service_root
    }

    fn pod_config_path(&self, pod_id: &str) -> Utf8PathBuf {
        self.config_root.join(format!("{pod_id}.yaml"))
    }

    /// Write the pod's service config and materialize a service dir per
    /// template. Unchanged inputs are left untouched so that an
    /// identical re-activation is invisible to the supervisor.
    pub async fn activate(
        &self,
        pod_id: &str,
        templates: &BTreeMap<String, ServiceTemplate>,
    ) -> Result<(), SupervisorError> {
        tokio::fs::create_dir_all(&self.config_root).await.map_err(|err| {
            SupervisorError::Io { path: self.config_root.clone(), err }
        })?;
        tokio::fs::create_dir_all(&self.service_root).await.map_err(
            |err| SupervisorError::Io {
                path: self.service_root.clone(),
                err,
            },
        )?;

        let config_path = self.pod_config_path(pod_id);
        let encoded = serde_yaml::to_string(templates).map_err(|err| {
            SupervisorError::Serialize { path: config_path.clone(), err }
        })?;
        write_if_changed(&config_path, encoded.as_bytes(), 0o644).await?;

        for (name, template) in templates {
            let service_dir = self.service_root.join(name);
            tokio::fs::create_dir_all(&service_dir).await.map_err(|err| {
                SupervisorError::Io { path: service_dir.clone(), err }
            })?;

            let run_path = service_dir.join("run");
            let script = self.render_run_script(template);
            write_if_changed(&run_path, script.as_bytes(), 0o755).await?;

            let down_path = service_dir.join("down");
            if template.down {
                write_if_changed(&down_path, b"", 0o644).await?;
            } else {
                match tokio::fs::remove_file(&down_path).await {
                    Ok(()) => {}
                    Err(err)
                        if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(SupervisorError::Io {
                            path: down_path,
                            err,
                        });
                    }
                }
            }
            debug!(self.log, "materialized service"; "service" => name);
        }

        info!(
            self.log,
            "activated supervisor config";
            "pod" => pod_id,
            "services" => templates.len(),
        );
        Ok(())
    }

    fn render_run_script(&self, template: &ServiceTemplate) -> String {
        let mut line = format!("exec {} -u {}", self.chpst_bin, template.user);
        for env_dir in &template.env_dirs {
            line.push_str(&format!(" -e {env_dir}"));
        }
        for arg in &template.run {
            line.push(' ');
            line.push_str(arg);
        }
        format!("#!/bin/sh\n{line}\n")
    }

    /// Remove service dirs that no pod config references anymore.
    pub async fn prune(&self) -> Result<(), SupervisorError> {
        let mut referenced = std::collections::BTreeSet::new();
        let mut configs = match tokio::fs::read_dir(&self.config_root).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => {
                return Err(SupervisorError::Io {
                    path: self.config_root.clone(),
                    err,
                });
            }
        };
        while let Some(entry) =
            configs.next_entry().await.map_err(|err| SupervisorError::Io {
                path: self.config_root.clone(),
                err,
            })?
        {
            let path = Utf8PathBuf::try_from(entry.path())
                .expect("supervisor config paths are utf-8");
            if path.extension() != Some("yaml") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await.map_err(
                |err| SupervisorError::Io { path: path.clone(), err },
            )?;
            let templates: BTreeMap<String, ServiceTemplate> =
                serde_yaml::from_str(&raw).map_err(|err| {
                    SupervisorError::Deserialize { path: path.clone(), err }
                })?;
            referenced.extend(templates.into_keys());
        }

        let mut services = match tokio::fs::read_dir(&self.service_root).await
        {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => {
                return Err(SupervisorError::Io {
                    path: self.service_root.clone(),
                    err,
                });
            }
        };
        while let Some(entry) =
            services.next_entry().await.map_err(|err| SupervisorError::Io {
                path: self.service_root.clone(),
                err,
            })?
        {
            let path = Utf8PathBuf::try_from(entry.path())
                .expect("supervisor service paths are utf-8");
            let Some(name) = path.file_name() else { continue };
            if !referenced.contains(name) {
                info!(self.log, "pruning stale service"; "service" => name);
                if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                    warn!(
                        self.log,
                        "failed to prune service dir";
                        "path" => path.as_str(),
                        "error" => InlineErrorChain::new(&err),
                    );
                }
            }
        }
        Ok(())
    }

    /// Drop the pod's service config. Pruning afterwards removes the
    /// now-unreferenced service dirs.
    pub async fn remove(&self, pod_id: &str) -> Result<(), SupervisorError> {
        let path = self.pod_config_path(pod_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SupervisorError::Io { path, err }),
        }
    }
}

async fn write_if_changed(
    path: &Utf8Path,
    contents: &[u8],
    mode: u32,
) -> Result<(), SupervisorError> {
    match tokio::fs::read(path).await {
        Ok(existing) if existing == contents => return Ok(()),
        _ => {}
    }
    let tmp = path.with_extension("new");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|err| SupervisorError::Io { path: tmp.clone(), err })?;
    tokio::fs::set_permissions(
        &tmp,
        std::fs::Permissions::from_mode(mode),
    )
    .await
    .map_err(|err| SupervisorError::Io { path: tmp.clone(), err })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| SupervisorError::Io { path: path.to_owned(), err })?;
    Ok(())
}

/// Wrapper around the supervisor's `sv` control tool.
#[derive(Clone, Debug)]
pub struct Sv {
    bin: Utf8PathBuf,
}

impl Sv {
    pub fn new(config: &SupervisorConfig) -> Sv {
        Sv { bin: config.sv_bin.clone() }
    }

    /// Start (or restart into the new version) a service, waiting up to
    /// `timeout` for it to come up.
    pub async fn restart(
        &self,
        service_dir: &Utf8Path,
        timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let mut command = tokio::process::Command::new(&self.bin);
        command
            .arg("-w")
            .arg(timeout.as_secs().to_string())
            .arg("restart")
            .arg(service_dir);
        execute(&mut command).await?;
        Ok(())
    }

    /// Start a service without enabling automatic restart.
    pub async fn once(
        &self,
        service_dir: &Utf8Path,
    ) -> Result<(), ExecutionError> {
        let mut command = tokio::process::Command::new(&self.bin);
        command.arg("once").arg(service_dir);
        execute(&mut command).await?;
        Ok(())
    }

    pub async fn stop(
        &self,
        service_dir: &Utf8Path,
        timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let mut command = tokio::process::Command::new(&self.bin);
        command
            .arg("-w")
            .arg(timeout.as_secs().to_string())
            .arg("stop")
            .arg(service_dir);
        execute(&mut command).await?;
        Ok(())
    }
}
