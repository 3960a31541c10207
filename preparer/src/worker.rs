// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-pod worker: serialized application of manifests for one pod id.
//!
//! The worker's sole input is a latest-desired cell (a `watch`
//! channel); the preparer overwrites the cell as new intent arrives, so
//! a manifest that lands during a retry sleep replaces the retry's
//! target rather than queueing behind it. The worker always acts on the
//! newest manifest it has seen, never a stale one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::backoff::{self, Backoff};
use stevedore_common::manifest::Manifest;
use stevedore_kv::pod_store::{PodStore, PodStoreError};
use stevedore_pod::hooks::{HookPhase, Hooks};
use stevedore_pod::pod::{Error as PodError, Pod};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Attempts at publishing reality before giving up until the next
/// transition.
const REALITY_PUBLISH_ATTEMPTS: usize = 3;

/// The lifecycle operations the worker drives; [`Pod`] in production,
/// a recording fake in tests.
#[async_trait]
pub trait PodLifecycle: Send + Sync + 'static {
    async fn install(&self, manifest: &Manifest) -> Result<(), PodError>;

    /// Returns whether every service started.
    async fn launch(&self, manifest: &Manifest) -> Result<bool, PodError>;

    async fn halt(&self, manifest: &Manifest) -> Result<bool, PodError>;

    /// The manifest currently recorded on disk, if any.
    async fn current_manifest(&self) -> Result<Option<Manifest>, PodError>;
}

#[async_trait]
impl PodLifecycle for Pod {
    async fn install(&self, manifest: &Manifest) -> Result<(), PodError> {
        Pod::install(self, manifest).await
    }

    async fn launch(&self, manifest: &Manifest) -> Result<bool, PodError> {
        Pod::launch(self, manifest).await
    }

    async fn halt(&self, manifest: &Manifest) -> Result<bool, PodError> {
        Pod::halt(self, manifest).await
    }

    async fn current_manifest(&self) -> Result<Option<Manifest>, PodError> {
        match Pod::current_manifest(self).await {
            Ok(manifest) => Ok(Some(manifest)),
            Err(PodError::NoCurrentManifest) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Where the worker records what it actually installed.
#[async_trait]
pub trait RealityPublisher: Send + Sync + 'static {
    async fn publish(&self, manifest: &Manifest) -> Result<(), PodStoreError>;
}

/// Publishes to `reality/<node>/<podId>` in the KV store.
pub struct KvRealityPublisher {
    store: PodStore,
    node: String,
}

impl KvRealityPublisher {
    pub fn new(store: PodStore, node: &str) -> KvRealityPublisher {
        KvRealityPublisher { store, node: node.to_string() }
    }
}

#[async_trait]
impl RealityPublisher for KvRealityPublisher {
    async fn publish(&self, manifest: &Manifest) -> Result<(), PodStoreError> {
        self.store.set_pod(&self.node, manifest).await.map(|_| ())
    }
}

/// Handle the preparer keeps per live worker.
pub struct WorkerHandle {
    pub(crate) manifest_tx: watch::Sender<Manifest>,
    pub(crate) quit_tx: watch::Sender<bool>,
    pub(crate) join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Overwrite the worker's desired manifest (latest wins). False
    /// means the worker is gone and must be respawned.
    pub fn send_manifest(&self, manifest: Manifest) -> bool {
        self.manifest_tx.send(manifest).is_ok()
    }

    pub fn signal_quit(&self) {
        let _ = self.quit_tx.send(true);
    }

    pub fn into_join(self) -> JoinHandle<()> {
        self.join
    }
}

pub fn spawn_worker<P, R>(
    pod_id: &str,
    lifecycle: Arc<P>,
    reality: Arc<R>,
    hooks: Arc<Hooks>,
    first_manifest: Manifest,
    log: &Logger,
) -> WorkerHandle
where
    P: PodLifecycle,
    R: RealityPublisher,
{
    let (manifest_tx, manifest_rx) = watch::channel(first_manifest);
    let (quit_tx, quit_rx) = watch::channel(false);
    let worker = Worker {
        pod_id: pod_id.to_string(),
        lifecycle,
        reality,
        hooks,
        manifest_rx,
        quit_rx,
        log: log.new(o!("component" => "PodWorker", "pod" => pod_id.to_string())),
    };
    let join = tokio::spawn(worker.run());
    WorkerHandle { manifest_tx, quit_tx, join }
}

enum Step {
    Applied,
    Quit,
}

struct Worker<P, R> {
    pod_id: String,
    lifecycle: Arc<P>,
    reality: Arc<R>,
    hooks: Arc<Hooks>,
    manifest_rx: watch::Receiver<Manifest>,
    quit_rx: watch::Receiver<bool>,
    log: Logger,
}

impl<P: PodLifecycle, R: RealityPublisher> Worker<P, R> {
    async fn run(mut self) {
        loop {
            match self.apply_latest().await {
                Step::Applied => {}
                Step::Quit => break,
            }
            tokio::select! {
                _ = self.quit_rx.changed() => break,
                changed = self.manifest_rx.changed() => {
                    if changed.is_err() {
                        // The preparer dropped us without a quit
                        // signal; treat it the same way.
                        break;
                    }
                }
            }
        }
        self.halt_for_exit().await;
    }

    /// Apply the newest manifest in the cell, retrying with backoff
    /// until it sticks, a newer manifest supersedes it (in which case
    /// the newer one is applied instead), or quit is signalled.
    async fn apply_latest(&mut self) -> Step {
        let mut retry = backoff::retry_policy_pod_worker();
        loop {
            if *self.quit_rx.borrow() {
                return Step::Quit;
            }
            let manifest = self.manifest_rx.borrow_and_update().clone();
            match self.apply_once(&manifest).await {
                Ok(()) => return Step::Applied,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to apply manifest; will retry";
                        "error" => err,
                    );
                    if !self.sleep_for_retry(&mut retry).await {
                        return Step::Quit;
                    }
                }
            }
        }
    }

    async fn apply_once(&self, manifest: &Manifest) -> Result<(), String> {
        self.hooks.run(HookPhase::BeforeInstall, manifest).await;

        self.lifecycle.install(manifest).await.map_err(|err| {
            format!("install failed: {}", InlineErrorChain::new(&err))
        })?;
        self.hooks.run(HookPhase::AfterInstall, manifest).await;

        let new_fingerprint = manifest.fingerprint().map_err(|err| {
            format!("cannot fingerprint manifest: {err}")
        })?;
        let current =
            self.lifecycle.current_manifest().await.map_err(|err| {
                format!(
                    "cannot read current manifest: {}",
                    InlineErrorChain::new(&err)
                )
            })?;
        if let Some(current) = &current {
            let current_fingerprint =
                current.fingerprint().map_err(|err| {
                    format!("cannot fingerprint current manifest: {err}")
                })?;
            if current_fingerprint == new_fingerprint {
                debug!(self.log, "manifest already current"; "fingerprint" => new_fingerprint);
                return Ok(());
            }
            info!(
                self.log,
                "halting old manifest before launch";
                "old" => &current_fingerprint,
                "new" => &new_fingerprint,
            );
            let halted = self.lifecycle.halt(current).await.map_err(|err| {
                format!("halt failed: {}", InlineErrorChain::new(&err))
            })?;
            if !halted {
                return Err("halt did not stop every service".to_string());
            }
        }

        self.hooks.run(HookPhase::BeforeLaunch, manifest).await;
        let started = self.lifecycle.launch(manifest).await.map_err(|err| {
            format!("launch failed: {}", InlineErrorChain::new(&err))
        })?;
        if !started {
            // The manifest is installed and recorded; the health
            // watcher will surface the failing services. Reality still
            // reflects what is on disk.
            warn!(self.log, "one or more services failed to start");
        }

        self.publish_reality(manifest).await;
        self.hooks.run(HookPhase::After, manifest).await;
        info!(self.log, "applied manifest"; "fingerprint" => new_fingerprint);
        Ok(())
    }

    async fn publish_reality(&self, manifest: &Manifest) {
        let mut retry = backoff::retry_policy_kv();
        for attempt in 1..=REALITY_PUBLISH_ATTEMPTS {
            match self.reality.publish(manifest).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to publish reality";
                        "attempt" => attempt,
                        "error" => InlineErrorChain::new(&err),
                    );
                    if attempt < REALITY_PUBLISH_ATTEMPTS {
                        let delay = retry
                            .next_backoff()
                            .unwrap_or(Duration::from_secs(1));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        // Reality lags until the next transition republishes it;
        // controllers are built to tolerate that.
    }

    /// Sleep out a retry delay. Returns early (true) when a newer
    /// manifest arrives so the caller re-reads the cell, and false on
    /// quit.
    async fn sleep_for_retry(
        &mut self,
        retry: &mut backoff::ExponentialBackoff,
    ) -> bool {
        let delay =
            retry.next_backoff().unwrap_or(Duration::from_secs(30));
        tokio::select! {
            _ = self.quit_rx.changed() => false,
            changed = self.manifest_rx.changed() => changed.is_ok(),
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// On the way out (intent disappeared or shutdown), halt the pod
    /// but leave it installed; uninstallation is an explicit operation.
    async fn halt_for_exit(&self) {
        match self.lifecycle.current_manifest().await {
            Ok(Some(manifest)) => {
                info!(self.log, "halting pod on worker exit");
                if let Err(err) = self.lifecycle.halt(&manifest).await {
                    warn!(
                        self.log,
                        "failed to halt pod on exit";
                        "error" => InlineErrorChain::new(&err),
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    self.log,
                    "cannot read current manifest on exit";
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
        debug!(self.log, "worker exited"; "pod" => &self.pod_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stevedore_common::logging::test_logger;
    use stevedore_common::manifest::ManifestBuilder;

    #[derive(Default)]
    struct FakeLifecycle {
        events: Mutex<Vec<String>>,
        install_failures: AtomicUsize,
        current: Mutex<Option<Manifest>>,
    }

    impl FakeLifecycle {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl PodLifecycle for FakeLifecycle {
        async fn install(&self, manifest: &Manifest) -> Result<(), PodError> {
            if self.install_failures.load(Ordering::SeqCst) > 0 {
                self.install_failures.fetch_sub(1, Ordering::SeqCst);
                self.record(format!("install-failed {}", manifest.id()));
                return Err(PodError::NoCurrentManifest);
            }
            self.record(format!("install {}", tag(manifest)));
            Ok(())
        }

        async fn launch(&self, manifest: &Manifest) -> Result<bool, PodError> {
            self.record(format!("launch {}", tag(manifest)));
            *self.current.lock().unwrap() = Some(manifest.clone());
            Ok(true)
        }

        async fn halt(&self, manifest: &Manifest) -> Result<bool, PodError> {
            self.record(format!("halt {}", tag(manifest)));
            Ok(true)
        }

        async fn current_manifest(
            &self,
        ) -> Result<Option<Manifest>, PodError> {
            Ok(self.current.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct FakeReality {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RealityPublisher for FakeReality {
        async fn publish(
            &self,
            manifest: &Manifest,
        ) -> Result<(), PodStoreError> {
            self.published.lock().unwrap().push(tag(manifest));
            Ok(())
        }
    }

    /// Short, readable identity for a manifest in event logs.
    fn tag(manifest: &Manifest) -> String {
        format!(
            "{}:{}",
            manifest.id(),
            manifest.status_port().unwrap_or(0)
        )
    }

    fn manifest(port: u16) -> Manifest {
        ManifestBuilder::new("web").status_port(port).build()
    }

    fn no_hooks() -> Arc<Hooks> {
        Arc::new(Hooks::new(
            "/nonexistent/hooks".into(),
            &test_logger("worker"),
        ))
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_applies_manifest_and_publishes_reality() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let reality = Arc::new(FakeReality::default());
        let handle = spawn_worker(
            "web",
            lifecycle.clone(),
            reality.clone(),
            no_hooks(),
            manifest(8080),
            &test_logger("worker"),
        );

        wait_until(|| {
            reality.published.lock().unwrap().contains(&"web:8080".into())
        })
        .await;
        assert_eq!(
            lifecycle.events(),
            vec!["install web:8080", "launch web:8080"]
        );

        handle.signal_quit();
        handle.into_join().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_fingerprint_is_a_no_op() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let reality = Arc::new(FakeReality::default());
        let handle = spawn_worker(
            "web",
            lifecycle.clone(),
            reality.clone(),
            no_hooks(),
            manifest(8080),
            &test_logger("worker"),
        );
        wait_until(|| lifecycle.events().len() == 2).await;

        // The same manifest again: installed, compared, not launched.
        assert!(handle.send_manifest(manifest(8080)));
        wait_until(|| lifecycle.events().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = lifecycle.events();
        assert_eq!(events[2], "install web:8080");
        assert_eq!(
            events.iter().filter(|e| e.starts_with("launch")).count(),
            1
        );

        handle.signal_quit();
        handle.into_join().await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_halts_old_before_launching_new() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let reality = Arc::new(FakeReality::default());
        let handle = spawn_worker(
            "web",
            lifecycle.clone(),
            reality.clone(),
            no_hooks(),
            manifest(8080),
            &test_logger("worker"),
        );
        wait_until(|| lifecycle.events().len() == 2).await;

        assert!(handle.send_manifest(manifest(9090)));
        wait_until(|| {
            lifecycle.events().iter().any(|e| e == "launch web:9090")
        })
        .await;

        let events = lifecycle.events();
        let halt_at =
            events.iter().position(|e| e == "halt web:8080").unwrap();
        let launch_at =
            events.iter().position(|e| e == "launch web:9090").unwrap();
        assert!(halt_at < launch_at);
        assert!(
            reality.published.lock().unwrap().contains(&"web:9090".into())
        );

        handle.signal_quit();
        handle.into_join().await.unwrap();
    }

    #[tokio::test]
    async fn test_newer_manifest_supersedes_retry() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        // The first install attempt fails, forcing a retry sleep.
        lifecycle.install_failures.store(1, Ordering::SeqCst);
        let reality = Arc::new(FakeReality::default());
        let handle = spawn_worker(
            "web",
            lifecycle.clone(),
            reality.clone(),
            no_hooks(),
            manifest(8080),
            &test_logger("worker"),
        );

        wait_until(|| {
            lifecycle
                .events()
                .iter()
                .any(|e| e == "install-failed web")
        })
        .await;

        // A newer manifest lands during the retry sleep; the pending
        // one must never be applied.
        assert!(handle.send_manifest(manifest(9090)));
        wait_until(|| {
            lifecycle.events().iter().any(|e| e == "launch web:9090")
        })
        .await;
        assert!(
            !lifecycle.events().iter().any(|e| e == "launch web:8080")
        );

        handle.signal_quit();
        handle.into_join().await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_halts_but_does_not_uninstall() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let reality = Arc::new(FakeReality::default());
        let handle = spawn_worker(
            "web",
            lifecycle.clone(),
            reality.clone(),
            no_hooks(),
            manifest(8080),
            &test_logger("worker"),
        );
        wait_until(|| lifecycle.events().len() == 2).await;

        handle.signal_quit();
        handle.into_join().await.unwrap();

        let events = lifecycle.events();
        assert_eq!(events.last().unwrap(), "halt web:8080");
    }
}
