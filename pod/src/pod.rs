// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pod: installed presence of one manifest id on this node.
//!
//! All lifecycle transitions are serialized per pod by an internal
//! mutex; callers may invoke them from concurrent tasks without
//! coordinating. `current_manifest.yaml` is the source of truth for
//! what is installed: it is either absent or a complete, parseable
//! manifest, maintained by staging writes to a temporary file and
//! renaming, with the previous file restored if anything goes wrong
//! mid-replacement.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use slog::{Logger, error, info, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::manifest::{
    CURRENT_MANIFEST_FILENAME, LaunchableStanza, Manifest, ManifestError,
    RestartPolicy, UnsupportedLaunchableType,
};

use crate::digest::{ArtifactDigest, DigestError, SignaturePolicy};
use crate::fetch::ArtifactFetcher;
use crate::hoist::HoistLaunchable;
use crate::launchable::{
    Launchable, LaunchableError, LaunchableFlags,
};
use crate::opencontainer::OpencontainerLaunchable;
use crate::supervisor::{
    Executable, ServiceBuilder, ServiceTemplate, SupervisorError, Sv,
    TemplateCgroup,
};
use crate::users::{self, UserError};

/// Default supervisor stop/restart wait for launchables that do not
/// name their own.
const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no current manifest for this pod")]
    NoCurrentManifest,

    #[error("current manifest for pod {expected:?} names pod {found:?}")]
    ManifestIdMismatch { expected: String, found: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    UnsupportedLaunchableType(#[from] UnsupportedLaunchableType),

    #[error("launchable {id} failed")]
    Launchable {
        id: String,
        #[source]
        err: LaunchableError,
    },

    #[error(transparent)]
    User(#[from] UserError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("duplicate service name {service:?} in pod {pod}")]
    DuplicateService { pod: String, service: String },

    #[error("digest verification failed for launchable {id}")]
    Digest {
        id: String,
        #[source]
        err: DigestError,
    },

    #[error("failed to replace the current manifest")]
    CurrentManifestWrite {
        #[source]
        err: std::io::Error,
    },

    /// The new manifest could not be written *and* the previous one
    /// could not be restored. The pod's on-disk state no longer
    /// describes what is running; only operator intervention (or a
    /// fresh install) clears this.
    #[error(
        "failed to replace the current manifest and could not restore \
         the previous one; pod is degraded"
    )]
    CurrentManifestFatal {
        #[source]
        err: std::io::Error,
    },

    #[error("I/O failure on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Dependencies a pod needs to act on the host, injected rather than
/// read from process-global state.
#[derive(Clone)]
pub struct PodDeps {
    pub service_builder: ServiceBuilder,
    pub sv: Sv,
    pub fetcher: ArtifactFetcher,
    pub flags: LaunchableFlags,
    /// Decides whether fetched artifact digests are trusted before an
    /// install is allowed to proceed.
    pub policy: Arc<dyn SignaturePolicy>,
    pub log: Logger,
}

pub struct Pod {
    id: String,
    home: Utf8PathBuf,
    log: Logger,
    service_builder: ServiceBuilder,
    sv: Sv,
    fetcher: ArtifactFetcher,
    flags: LaunchableFlags,
    policy: Arc<dyn SignaturePolicy>,
    default_timeout: Duration,
    ops_lock: tokio::sync::Mutex<()>,
}

impl Pod {
    /// A pod rooted at `<pod_root>/<id>`.
    pub fn at(pod_root: &Utf8Path, id: &str, deps: PodDeps) -> Pod {
        let home = pod_root.join(id);
        Pod {
            log: deps.log.new(o!("pod" => id.to_string())),
            id: id.to_string(),
            home,
            service_builder: deps.service_builder,
            sv: deps.sv,
            fetcher: deps.fetcher,
            flags: deps.flags,
            policy: deps.policy,
            default_timeout: DEFAULT_RESTART_TIMEOUT,
            ops_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Recover a pod from an existing directory, taking the id from its
    /// current manifest.
    pub async fn existing(home: Utf8PathBuf, deps: PodDeps) -> Result<Pod, Error> {
        let manifest_path = home.join(CURRENT_MANIFEST_FILENAME);
        if !manifest_path.exists() {
            return Err(Error::NoCurrentManifest);
        }
        let manifest = Manifest::from_path(&manifest_path)?;
        let parent = home
            .parent()
            .map(Utf8Path::to_owned)
            .unwrap_or_else(|| Utf8PathBuf::from("/"));
        Ok(Pod::at(&parent, manifest.id(), deps))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn home(&self) -> &Utf8Path {
        &self.home
    }

    pub fn config_dir(&self) -> Utf8PathBuf {
        self.home.join("config")
    }

    pub fn env_dir(&self) -> Utf8PathBuf {
        self.home.join("env")
    }

    fn current_manifest_path(&self) -> Utf8PathBuf {
        self.home.join(CURRENT_MANIFEST_FILENAME)
    }

    /// The manifest this pod currently has installed, or
    /// [`Error::NoCurrentManifest`].
    pub async fn current_manifest(&self) -> Result<Manifest, Error> {
        let path = self.current_manifest_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoCurrentManifest);
            }
            Err(err) => return Err(Error::Io { path, err }),
        };
        let manifest = Manifest::from_str(&raw)?;
        if manifest.id() != self.id {
            return Err(Error::ManifestIdMismatch {
                expected: self.id.clone(),
                found: manifest.id().to_string(),
            });
        }
        Ok(manifest)
    }

    /// Ensure every artifact in `manifest` is present on this host and
    /// the pod's config and environment are written. Does not start
    /// anything.
    ///
    /// Stanzas that publish a digest are verified as part of
    /// installation: the digest (and its signature, when one is named)
    /// must pass the pod's policy and the extracted files must match
    /// it exactly, or the whole install fails and nothing launches.
    pub async fn install(&self, manifest: &Manifest) -> Result<(), Error> {
        let _guard = self.ops_lock.lock().await;
        let (uid, gid) = users::ids(manifest.run_as_user())?;
        users::mkdir_chown_all(&self.home, uid, gid, 0o755).await?;

        let launchables = self.launchables(manifest)?;
        for ((_, stanza), launchable) in
            manifest.launchables().iter().zip(&launchables)
        {
            launchable.install().await.map_err(|err| Error::Launchable {
                id: launchable.id().to_string(),
                err,
            })?;
            self.verify_stanza(stanza, launchable.as_ref(), &*self.policy)
                .await?;
        }

        self.setup_config(manifest, &launchables, uid, gid).await?;
        info!(self.log, "successfully installed");
        Ok(())
    }

    /// Make `manifest` the pod's running state: record it as current,
    /// flip every launchable's `current` symlink, rebuild supervision,
    /// and start services.
    ///
    /// A service that fails to start yields `Ok(false)`; the error
    /// return is reserved for failures that leave the pod unsafe to
    /// retry blindly (unwritable current manifest, failed symlink
    /// flip).
    pub async fn launch(&self, manifest: &Manifest) -> Result<bool, Error> {
        let _guard = self.ops_lock.lock().await;
        let launchables = self.launchables(manifest)?;
        let (uid, gid) = users::ids(manifest.run_as_user())?;

        let staged_old =
            self.write_current_manifest(manifest, uid, gid).await?;

        let mut post_activated = Vec::with_capacity(launchables.len());
        for launchable in &launchables {
            launchable.make_current().await.map_err(|err| {
                Error::Launchable { id: launchable.id().to_string(), err }
            })?;
            match launchable.post_activate().await {
                Ok(Some(output)) if !output.trim().is_empty() => {
                    info!(
                        self.log,
                        "post-activate succeeded";
                        "launchable" => launchable.id(),
                        "output" => output.trim(),
                    );
                    post_activated.push(true);
                }
                Ok(_) => post_activated.push(true),
                Err(err) => {
                    error!(
                        self.log,
                        "post-activate failed; not starting this cycle";
                        "launchable" => launchable.id(),
                        "error" => InlineErrorChain::new(&err),
                    );
                    post_activated.push(false);
                }
            }
        }

        let mut templates = BTreeMap::new();
        let mut all_execs = Vec::with_capacity(launchables.len());
        for launchable in &launchables {
            let execs = launchable
                .executables(&self.service_builder)
                .await
                .map_err(|err| Error::Launchable {
                    id: launchable.id().to_string(),
                    err,
                })?;
            for exec in &execs {
                if templates.contains_key(&exec.service.name) {
                    return Err(Error::DuplicateService {
                        pod: self.id.clone(),
                        service: exec.service.name.clone(),
                    });
                }
                templates.insert(
                    exec.service.name.clone(),
                    self.template_for(launchable.as_ref(), exec),
                );
            }
            all_execs.push(execs);
        }
        self.service_builder.activate(&self.id, &templates).await?;
        self.service_builder.prune().await?;

        let mut success = true;
        for (i, (launchable, execs)) in
            launchables.iter().zip(&all_execs).enumerate()
        {
            if !post_activated[i] {
                continue;
            }
            let result = match launchable.start(execs, &self.sv).await {
                Ok(()) => launchable.enable().await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_warning() => {
                    warn!(
                        self.log,
                        "could not enable launchable";
                        "launchable" => launchable.id(),
                        "error" => InlineErrorChain::new(&err),
                    );
                }
                Err(err) => {
                    error!(
                        self.log,
                        "could not launch launchable";
                        "launchable" => launchable.id(),
                        "error" => InlineErrorChain::new(&err),
                    );
                    success = false;
                }
            }
        }

        if let Some(staged) = staged_old {
            let _ = tokio::fs::remove_file(staged).await;
        }

        if success {
            info!(self.log, "successfully launched");
        } else {
            info!(
                self.log,
                "launched pod but one or more services failed to start"
            );
        }
        Ok(success)
    }

    /// Stop and disable every launchable in `manifest`. Disable
    /// failures are warnings; stop failures make this report
    /// non-success.
    pub async fn halt(&self, manifest: &Manifest) -> Result<bool, Error> {
        let _guard = self.ops_lock.lock().await;
        self.halt_locked(manifest).await
    }

    async fn halt_locked(&self, manifest: &Manifest) -> Result<bool, Error> {
        let launchables = self.launchables(manifest)?;
        let mut success = true;
        for launchable in &launchables {
            let execs = launchable
                .executables(&self.service_builder)
                .await
                .map_err(|err| Error::Launchable {
                    id: launchable.id().to_string(),
                    err,
                })?;
            match launchable.stop(&execs, &self.sv).await {
                Ok(()) => {}
                Err(err) => {
                    error!(
                        self.log,
                        "could not halt launchable";
                        "launchable" => launchable.id(),
                        "error" => InlineErrorChain::new(&err),
                    );
                    success = false;
                    continue;
                }
            }
            if let Err(err) = launchable.disable().await {
                warn!(
                    self.log,
                    "could not disable launchable";
                    "launchable" => launchable.id(),
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
        if success {
            info!(self.log, "successfully halted");
        } else {
            info!(
                self.log,
                "attempted halt, but one or more services did not stop"
            );
        }
        Ok(success)
    }

    /// Tear the pod off this host: halt it, drop its supervisor
    /// config, and remove its directory. Best-effort throughout.
    pub async fn uninstall(&self) -> Result<(), Error> {
        let _guard = self.ops_lock.lock().await;
        let manifest = self.current_manifest().await?;
        if let Err(err) = self.halt_locked(&manifest).await {
            warn!(
                self.log,
                "halt during uninstall failed; continuing";
                "error" => InlineErrorChain::new(&err),
            );
        }
        self.service_builder.remove(&self.id).await?;
        self.service_builder.prune().await?;
        tokio::fs::remove_dir_all(&self.home).await.map_err(|err| {
            Error::Io { path: self.home.clone(), err }
        })?;
        info!(self.log, "uninstalled");
        Ok(())
    }

    /// Re-verify installed artifacts against their published digests,
    /// checking the digests themselves against `policy` first. Install
    /// performs the same checks; this is for auditing a pod that is
    /// already on disk.
    pub async fn verify(
        &self,
        manifest: &Manifest,
        policy: &dyn SignaturePolicy,
    ) -> Result<(), Error> {
        for (stanza_id, stanza) in manifest.launchables() {
            let launchable =
                self.launchable_for(manifest, stanza_id, stanza)?;
            self.verify_stanza(stanza, launchable.as_ref(), policy).await?;
        }
        Ok(())
    }

    /// Verify one stanza's installed files against its published
    /// digest. Stanzas without a digest location pass trivially.
    async fn verify_stanza(
        &self,
        stanza: &LaunchableStanza,
        launchable: &dyn Launchable,
        policy: &dyn SignaturePolicy,
    ) -> Result<(), Error> {
        let Some(digest_location) = &stanza.digest_location else {
            return Ok(());
        };
        let id = launchable.id().to_string();

        let fetched = ArtifactDigest::fetch(
            &self.fetcher,
            digest_location,
            stanza.digest_signature_location.as_deref(),
        )
        .await
        .map_err(|err| Error::Digest { id: id.clone(), err })?;

        policy
            .check_digest(&fetched.raw, fetched.signature.as_deref())
            .map_err(|err| Error::Digest {
                id: id.clone(),
                err: err.into(),
            })?;

        fetched
            .digest
            .verify_dir(&launchable.install_dir())
            .await
            .map_err(|err| Error::Digest { id, err })?;
        Ok(())
    }

    /// Trim old artifact versions across every launchable.
    pub async fn prune(&self, manifest: &Manifest, max_bytes: u64) {
        let launchables = match self.launchables(manifest) {
            Ok(launchables) => launchables,
            Err(_) => return,
        };
        for launchable in &launchables {
            if let Err(err) = launchable.prune(max_bytes).await {
                error!(
                    self.log,
                    "could not prune launchable";
                    "launchable" => launchable.id(),
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
    }

    fn template_for(
        &self,
        launchable: &dyn Launchable,
        exec: &Executable,
    ) -> ServiceTemplate {
        let cgroup = launchable.cgroup();
        ServiceTemplate {
            run: exec.exec.clone(),
            user: launchable.user().to_string(),
            env_dirs: vec![self.env_dir(), launchable.env_dir()],
            down: launchable.restart_policy() == RestartPolicy::Never,
            cgroup: (cgroup.cpus.is_some() || cgroup.memory.is_some())
                .then(|| TemplateCgroup {
                    name: launchable.id().to_string(),
                    cpus: cgroup.cpus,
                    memory: cgroup.memory,
                }),
        }
    }

    fn launchables(
        &self,
        manifest: &Manifest,
    ) -> Result<Vec<Box<dyn Launchable>>, Error> {
        manifest
            .launchables()
            .iter()
            .map(|(stanza_id, stanza)| {
                self.launchable_for(manifest, stanza_id, stanza)
            })
            .collect()
    }

    fn launchable_for(
        &self,
        manifest: &Manifest,
        stanza_id: &str,
        stanza: &LaunchableStanza,
    ) -> Result<Box<dyn Launchable>, Error> {
        use stevedore_common::manifest::LaunchableType;

        let launchable_type = stanza.launchable_type()?;
        let wrap = |err| Error::Launchable {
            id: format!("{}__{}", self.id, stanza_id),
            err,
        };
        match launchable_type {
            LaunchableType::Hoist => Ok(Box::new(
                HoistLaunchable::new(
                    &self.id,
                    stanza_id,
                    stanza,
                    manifest.run_as_user(),
                    manifest.restart_policy(),
                    self.default_timeout,
                    &self.home,
                    self.fetcher.clone(),
                    &self.log,
                )
                .map_err(wrap)?,
            )),
            LaunchableType::Opencontainer
                if self.flags.enable_opencontainer =>
            {
                Ok(Box::new(
                    OpencontainerLaunchable::new(
                        &self.id,
                        stanza_id,
                        stanza,
                        manifest.run_as_user(),
                        manifest.restart_policy(),
                        self.default_timeout,
                        &self.home,
                        self.flags.oci_runtime.clone(),
                        self.fetcher.clone(),
                        &self.log,
                    )
                    .map_err(wrap)?,
                ))
            }
            LaunchableType::Opencontainer => Err(
                UnsupportedLaunchableType("opencontainer".to_string()).into(),
            ),
        }
    }

    /// Stage the existing current manifest aside, then atomically
    /// replace it with `manifest`. Returns the staged copy's path so
    /// the caller can clean it up after a successful launch. On write
    /// failure the staged copy is moved back; if even that fails the
    /// pod is degraded and the error says so.
    async fn write_current_manifest(
        &self,
        manifest: &Manifest,
        uid: u32,
        gid: u32,
    ) -> Result<Option<Utf8PathBuf>, Error> {
        let current = self.current_manifest_path();
        let staged = self.home.join(".last_manifest.yaml");

        let had_previous = current.exists();
        if had_previous {
            tokio::fs::copy(&current, &staged).await.map_err(|err| {
                Error::CurrentManifestWrite { err }
            })?;
        }

        let encoded = manifest.to_yaml()?;
        let result = self
            .replace_current_manifest(&current, encoded.as_bytes(), uid, gid)
            .await;
        match result {
            Ok(()) => Ok(had_previous.then_some(staged)),
            Err(err) => {
                if had_previous {
                    if let Err(revert_err) =
                        tokio::fs::rename(&staged, &current).await
                    {
                        error!(
                            self.log,
                            "could not restore previous manifest";
                            "error" => InlineErrorChain::new(&revert_err),
                        );
                        return Err(Error::CurrentManifestFatal {
                            err: revert_err,
                        });
                    }
                }
                Err(Error::CurrentManifestWrite { err })
            }
        }
    }

    async fn replace_current_manifest(
        &self,
        current: &Utf8Path,
        encoded: &[u8],
        uid: u32,
        gid: u32,
    ) -> Result<(), std::io::Error> {
        let tmp = self.home.join(".current_manifest.yaml.new");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::set_permissions(
            &tmp,
            std::fs::Permissions::from_mode(0o644),
        )
        .await?;
        std::os::unix::fs::chown(
            tmp.as_std_path(),
            Some(uid),
            Some(gid),
        )?;
        tokio::fs::rename(&tmp, current).await
    }

    async fn setup_config(
        &self,
        manifest: &Manifest,
        launchables: &[Box<dyn Launchable>],
        uid: u32,
        gid: u32,
    ) -> Result<(), Error> {
        let config_dir = self.config_dir();
        users::mkdir_chown_all(&config_dir, uid, gid, 0o755).await?;

        let config_path = config_dir.join(manifest.config_file_name()?);
        write_config_file(
            &config_path,
            manifest.write_config()?.as_bytes(),
            uid,
            gid,
        )
        .await?;

        let platform_config_path =
            config_dir.join(manifest.platform_config_file_name()?);
        write_config_file(
            &platform_config_path,
            manifest.write_platform_config()?.as_bytes(),
            uid,
            gid,
        )
        .await?;

        let env_dir = self.env_dir();
        users::mkdir_chown_all(&env_dir, uid, gid, 0o755).await?;
        users::write_env_file(
            &env_dir,
            "CONFIG_PATH",
            config_path.as_str(),
            uid,
            gid,
        )
        .await?;
        users::write_env_file(
            &env_dir,
            "PLATFORM_CONFIG_PATH",
            platform_config_path.as_str(),
            uid,
            gid,
        )
        .await?;
        users::write_env_file(&env_dir, "POD_HOME", self.home.as_str(), uid, gid)
            .await?;

        for launchable in launchables {
            let launchable_env = launchable.env_dir();
            users::mkdir_chown_all(&launchable_env, uid, gid, 0o755).await?;
            users::write_env_file(
                &launchable_env,
                "LAUNCHABLE_ROOT",
                launchable.install_dir().as_str(),
                uid,
                gid,
            )
            .await?;
        }
        Ok(())
    }
}

async fn write_config_file(
    path: &Utf8Path,
    contents: &[u8],
    uid: u32,
    gid: u32,
) -> Result<(), Error> {
    let tmp = path.with_extension("new");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|err| Error::Io { path: tmp.clone(), err })?;
    tokio::fs::set_permissions(
        &tmp,
        std::fs::Permissions::from_mode(0o644),
    )
    .await
    .map_err(|err| Error::Io { path: tmp.clone(), err })?;
    users::chown_path(&tmp, uid, gid)?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| Error::Io { path: path.to_owned(), err })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use flate2::Compression;
    use httptest::Expectation;
    use httptest::matchers::request;
    use httptest::responders::status_code;
    use stevedore_common::logging::test_logger;
    use stevedore_common::manifest::{CgroupConfig, ManifestBuilder};

    use crate::digest::InsecurePolicy;
    use crate::supervisor::SupervisorConfig;

    struct TestPod {
        _tmp: Utf8TempDir,
        pod_root: Utf8PathBuf,
        supervisor: SupervisorConfig,
        deps: PodDeps,
    }

    impl TestPod {
        fn new(test_name: &'static str) -> TestPod {
            let tmp = Utf8TempDir::new().unwrap();
            let log = test_logger(test_name);
            let supervisor = SupervisorConfig {
                config_root: tmp.path().join("servicebuilder.d"),
                service_root: tmp.path().join("service"),
                sv_bin: "/bin/true".into(),
                chpst_bin: "/usr/bin/chpst".into(),
            };
            let deps = PodDeps {
                service_builder: ServiceBuilder::new(&supervisor, &log),
                sv: Sv::new(&supervisor),
                fetcher: ArtifactFetcher::new(&log),
                flags: LaunchableFlags::default(),
                policy: Arc::new(InsecurePolicy::new(&log)),
                log,
            };
            TestPod {
                pod_root: tmp.path().join("pods"),
                _tmp: tmp,
                supervisor,
                deps,
            }
        }

        fn pod(&self, id: &str) -> Pod {
            Pod::at(&self.pod_root, id, self.deps.clone())
        }
    }

    /// A minimal hoist artifact: bin/launch plus a post-activate that
    /// records it ran.
    fn hoist_tarball(launch_body: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(
            flate2::write::GzEncoder::new(Vec::new(), Compression::fast()),
        );
        let mut add_script = |path: &str, body: &str| {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, body.as_bytes()).unwrap();
        };
        add_script("bin/launch", launch_body);
        add_script("bin/post-activate", "#!/bin/sh\nexit 0\n");
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn serve_tarball(
        server: &httptest::Server,
        path: &str,
        tarball: Vec<u8>,
    ) -> String {
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                path.to_string(),
            ))
            .times(..)
            .respond_with(status_code(200).body(tarball)),
        );
        server.url_str(path)
    }

    fn manifest_with_artifact(id: &str, location: &str) -> Manifest {
        let user = users::current_username().unwrap();
        ManifestBuilder::new(id)
            .run_as(&user)
            .status_port(8080)
            .launchable(
                "app",
                LaunchableStanza {
                    launchable_type: "hoist".to_string(),
                    location: location.to_string(),
                    digest_location: None,
                    digest_signature_location: None,
                    cgroup: CgroupConfig::default(),
                    restart_timeout: None,
                },
            )
            .build()
    }

    #[tokio::test]
    async fn test_install_lays_out_pod_directory() {
        let harness = TestPod::new("test_install_lays_out_pod_directory");
        let server = httptest::Server::run();
        let url =
            serve_tarball(&server, "/app_1.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));
        let manifest = manifest_with_artifact("web", &url);

        let pod = harness.pod("web");
        pod.install(&manifest).await.unwrap();

        let home = harness.pod_root.join("web");
        assert!(home.join("app/installs/app_1.0.0/bin/launch").exists());
        assert!(home
            .join(format!(
                "config/web_{}.yaml",
                manifest.fingerprint().unwrap()
            ))
            .exists());
        let config_path =
            tokio::fs::read_to_string(home.join("env/CONFIG_PATH"))
                .await
                .unwrap();
        assert!(config_path.ends_with(&format!(
            "web_{}.yaml",
            manifest.fingerprint().unwrap()
        )));
        let launchable_root = tokio::fs::read_to_string(
            home.join("app/env/LAUNCHABLE_ROOT"),
        )
        .await
        .unwrap();
        assert!(launchable_root.ends_with("app/installs/app_1.0.0"));

        // Install is idempotent.
        pod.install(&manifest).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_flips_symlink_and_builds_services() {
        let harness =
            TestPod::new("test_launch_flips_symlink_and_builds_services");
        let server = httptest::Server::run();
        let url =
            serve_tarball(&server, "/app_1.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));
        let manifest = manifest_with_artifact("web", &url);

        let pod = harness.pod("web");
        pod.install(&manifest).await.unwrap();
        let success = pod.launch(&manifest).await.unwrap();
        assert!(success);

        let home = harness.pod_root.join("web");
        let current = tokio::fs::read_link(home.join("app/current"))
            .await
            .unwrap();
        assert!(current.ends_with("app/installs/app_1.0.0"));

        let recorded = pod.current_manifest().await.unwrap();
        assert_eq!(
            recorded.fingerprint().unwrap(),
            manifest.fingerprint().unwrap()
        );

        assert!(
            harness.supervisor.config_root.join("web.yaml").exists()
        );
        let run = tokio::fs::read_to_string(
            harness.supervisor.service_root.join("web__app/run"),
        )
        .await
        .unwrap();
        assert!(run.contains("app/current/bin/launch"));
    }

    #[tokio::test]
    async fn test_relaunch_same_manifest_keeps_symlink() {
        let harness =
            TestPod::new("test_relaunch_same_manifest_keeps_symlink");
        let server = httptest::Server::run();
        let url =
            serve_tarball(&server, "/app_1.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));
        let manifest = manifest_with_artifact("web", &url);

        let pod = harness.pod("web");
        pod.install(&manifest).await.unwrap();
        assert!(pod.launch(&manifest).await.unwrap());

        let home = harness.pod_root.join("web");
        let link_before = tokio::fs::symlink_metadata(home.join("app/current"))
            .await
            .unwrap()
            .modified()
            .unwrap();
        assert!(pod.launch(&manifest).await.unwrap());
        let link_after = tokio::fs::symlink_metadata(home.join("app/current"))
            .await
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(link_before, link_after);
    }

    #[tokio::test]
    async fn test_upgrade_installs_new_version_alongside() {
        let harness =
            TestPod::new("test_upgrade_installs_new_version_alongside");
        let server = httptest::Server::run();
        let url_v1 =
            serve_tarball(&server, "/app_1.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));
        let url_v2 =
            serve_tarball(&server, "/app_2.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));

        let pod = harness.pod("web");
        let v1 = manifest_with_artifact("web", &url_v1);
        pod.install(&v1).await.unwrap();
        assert!(pod.launch(&v1).await.unwrap());

        let v2 = manifest_with_artifact("web", &url_v2);
        pod.install(&v2).await.unwrap();
        assert!(pod.halt(&v1).await.unwrap());
        assert!(pod.launch(&v2).await.unwrap());

        let home = harness.pod_root.join("web");
        assert!(home.join("app/installs/app_1.0.0").exists());
        assert!(home.join("app/installs/app_2.0.0").exists());
        let current = tokio::fs::read_link(home.join("app/current"))
            .await
            .unwrap();
        assert!(current.ends_with("app/installs/app_2.0.0"));
        assert_eq!(
            pod.current_manifest().await.unwrap().fingerprint().unwrap(),
            v2.fingerprint().unwrap()
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_current_version() {
        let harness = TestPod::new("test_prune_keeps_current_version");
        let server = httptest::Server::run();
        let url_v1 =
            serve_tarball(&server, "/app_1.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));
        let url_v2 =
            serve_tarball(&server, "/app_2.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));

        let pod = harness.pod("web");
        let v1 = manifest_with_artifact("web", &url_v1);
        pod.install(&v1).await.unwrap();
        assert!(pod.launch(&v1).await.unwrap());
        let v2 = manifest_with_artifact("web", &url_v2);
        pod.install(&v2).await.unwrap();
        assert!(pod.halt(&v1).await.unwrap());
        assert!(pod.launch(&v2).await.unwrap());

        // A zero budget still spares whatever `current` points at.
        pod.prune(&v2, 0).await;
        let home = harness.pod_root.join("web");
        assert!(home.join("app/installs/app_2.0.0").exists());
        assert!(!home.join("app/installs/app_1.0.0").exists());
    }

    #[tokio::test]
    async fn test_halt_of_never_launched_pod_succeeds() {
        let harness =
            TestPod::new("test_halt_of_never_launched_pod_succeeds");
        let manifest = manifest_with_artifact(
            "web",
            "https://art.example/app_1.0.0.tar.gz",
        );
        let pod = harness.pod("web");
        assert!(pod.halt(&manifest).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsupported_launchable_type_fails_install() {
        let harness =
            TestPod::new("test_unsupported_launchable_type_fails_install");
        let user = users::current_username().unwrap();
        let manifest = ManifestBuilder::new("web")
            .run_as(&user)
            .launchable(
                "app",
                LaunchableStanza {
                    launchable_type: "warp-drive".to_string(),
                    location: "https://art.example/app.tar.gz".to_string(),
                    digest_location: None,
                    digest_signature_location: None,
                    cgroup: CgroupConfig::default(),
                    restart_timeout: None,
                },
            )
            .build();

        let pod = harness.pod("web");
        assert!(matches!(
            pod.install(&manifest).await,
            Err(Error::UnsupportedLaunchableType(_))
        ));
        assert!(pod.current_manifest().await.is_err());
    }

    #[tokio::test]
    async fn test_opencontainer_gated_by_flag() {
        let harness = TestPod::new("test_opencontainer_gated_by_flag");
        let user = users::current_username().unwrap();
        let manifest = ManifestBuilder::new("web")
            .run_as(&user)
            .launchable(
                "app",
                LaunchableStanza {
                    launchable_type: "opencontainer".to_string(),
                    location: "https://art.example/app_1.0.0.tar.gz"
                        .to_string(),
                    digest_location: None,
                    digest_signature_location: None,
                    cgroup: CgroupConfig::default(),
                    restart_timeout: None,
                },
            )
            .build();

        let pod = harness.pod("web");
        let err = pod.install(&manifest).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedLaunchableType(_)));
    }

    #[tokio::test]
    async fn test_uninstall_removes_pod() {
        let harness = TestPod::new("test_uninstall_removes_pod");
        let server = httptest::Server::run();
        let url =
            serve_tarball(&server, "/app_1.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));
        let manifest = manifest_with_artifact("web", &url);

        let pod = harness.pod("web");
        pod.install(&manifest).await.unwrap();
        assert!(pod.launch(&manifest).await.unwrap());

        pod.uninstall().await.unwrap();
        assert!(!harness.pod_root.join("web").exists());
        assert!(
            !harness.supervisor.config_root.join("web.yaml").exists()
        );
        assert!(
            !harness.supervisor.service_root.join("web__app").exists()
        );
    }

    fn hex_digest(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Manifest whose single hoist stanza names a digest location.
    fn manifest_with_digest(
        id: &str,
        location: &str,
        digest_location: &str,
    ) -> Manifest {
        let user = users::current_username().unwrap();
        ManifestBuilder::new(id)
            .run_as(&user)
            .launchable(
                "app",
                LaunchableStanza {
                    launchable_type: "hoist".to_string(),
                    location: location.to_string(),
                    digest_location: Some(digest_location.to_string()),
                    digest_signature_location: None,
                    cgroup: CgroupConfig::default(),
                    restart_timeout: None,
                },
            )
            .build()
    }

    #[tokio::test]
    async fn test_install_rejects_mismatched_digest() {
        let harness = TestPod::new("test_install_rejects_mismatched_digest");
        let server = httptest::Server::run();
        let url =
            serve_tarball(&server, "/app_1.0.0.tar.gz", hoist_tarball("#!/bin/sh\nexit 0\n"));

        // Publish a digest that does not match the artifact contents.
        let bogus = format!("{}  bin/launch\n", "0".repeat(64));
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/app_1.0.0.tar.gz.sha256",
            ))
            .times(..)
            .respond_with(status_code(200).body(bogus)),
        );

        let manifest = manifest_with_digest(
            "web",
            &url,
            &server.url_str("/app_1.0.0.tar.gz.sha256"),
        );
        let pod = harness.pod("web");

        let err = pod.install(&manifest).await.unwrap_err();
        assert!(matches!(err, Error::Digest { .. }));
        // Nothing was recorded as current; the pod never launches.
        assert!(matches!(
            pod.current_manifest().await,
            Err(Error::NoCurrentManifest)
        ));
    }

    #[tokio::test]
    async fn test_verify_catches_post_install_tampering() {
        let harness =
            TestPod::new("test_verify_catches_post_install_tampering");
        let server = httptest::Server::run();
        let launch_body = "#!/bin/sh\nexit 0\n";
        let url = serve_tarball(
            &server,
            "/app_1.0.0.tar.gz",
            hoist_tarball(launch_body),
        );

        // A correct digest covering exactly the artifact's files.
        let digest = format!(
            "{}  bin/launch\n{}  bin/post-activate\n",
            hex_digest(launch_body.as_bytes()),
            hex_digest(b"#!/bin/sh\nexit 0\n"),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/app_1.0.0.tar.gz.sha256",
            ))
            .times(..)
            .respond_with(status_code(200).body(digest)),
        );

        let manifest = manifest_with_digest(
            "web",
            &url,
            &server.url_str("/app_1.0.0.tar.gz.sha256"),
        );
        let pod = harness.pod("web");
        pod.install(&manifest).await.unwrap();

        // Someone rewrites an installed file after the fact.
        let launch_path = harness
            .pod_root
            .join("web/app/installs/app_1.0.0/bin/launch");
        tokio::fs::write(&launch_path, b"#!/bin/sh\nexit 1\n")
            .await
            .unwrap();

        let policy = InsecurePolicy::new(&test_logger("verify"));
        let err = pod.verify(&manifest, &policy).await.unwrap_err();
        assert!(matches!(err, Error::Digest { .. }));
    }
}
