// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-node reconcile loop: intent in, workers out.
//!
//! Each intent snapshot is diffed against the live worker map. Pod ids
//! new to the snapshot get a worker; ids already served get their
//! latest-desired cell overwritten; ids that vanished get their quit
//! signal, which halts the pod (uninstallation is an explicit operation
//! elsewhere, never a side effect of intent disappearing).

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use slog::{Logger, info, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::manifest::Manifest;
use stevedore_kv::pod_store::{ManifestResult, PodStore};
use stevedore_pod::hooks::Hooks;
use stevedore_pod::pod::{Pod, PodDeps};
use tokio::sync::watch;

use crate::worker::{
    KvRealityPublisher, WorkerHandle, spawn_worker,
};

#[derive(Debug, thiserror::Error)]
pub enum PreparerError {
    /// The intent watch stream closed underneath us; the loop cannot
    /// make progress without it.
    #[error("intent watch stream closed unexpectedly")]
    WatchClosed,
}

pub struct Preparer {
    node: String,
    intent: PodStore,
    reality: Arc<KvRealityPublisher>,
    hooks: Arc<Hooks>,
    pod_root: Utf8PathBuf,
    pod_deps: PodDeps,
    log: Logger,
}

impl Preparer {
    pub fn new(
        node: &str,
        intent: PodStore,
        reality: KvRealityPublisher,
        hooks: Hooks,
        pod_root: Utf8PathBuf,
        pod_deps: PodDeps,
        log: &Logger,
    ) -> Preparer {
        Preparer {
            node: node.to_string(),
            intent,
            reality: Arc::new(reality),
            hooks: Arc::new(hooks),
            pod_root,
            pod_deps,
            log: log.new(o!("component" => "Preparer")),
        }
    }

    /// Run until quit. An `Err` return means the loop died in a way a
    /// supervisor should treat as irrecoverable.
    pub async fn run(
        &self,
        mut quit: watch::Receiver<bool>,
    ) -> Result<(), PreparerError> {
        info!(self.log, "watching intent"; "node" => &self.node);
        let (mut snapshots, mut errors) =
            self.intent.watch_pods(&self.node, quit.clone());
        let mut workers: BTreeMap<String, WorkerHandle> = BTreeMap::new();

        loop {
            tokio::select! {
                _ = quit.changed() => {
                    self.shutdown_workers(workers).await;
                    return Ok(());
                }
                Some(err) = errors.recv() => {
                    warn!(
                        self.log,
                        "intent entry skipped";
                        "error" => InlineErrorChain::new(&err),
                    );
                }
                snapshot = snapshots.recv() => {
                    match snapshot {
                        None => {
                            self.shutdown_workers(workers).await;
                            return Err(PreparerError::WatchClosed);
                        }
                        Some(snapshot) => {
                            self.reconcile(&mut workers, snapshot);
                        }
                    }
                }
            }
        }
    }

    fn reconcile(
        &self,
        workers: &mut BTreeMap<String, WorkerHandle>,
        snapshot: Vec<ManifestResult>,
    ) {
        let mut desired: BTreeMap<String, Manifest> = BTreeMap::new();
        for result in snapshot {
            let pod_id = result.manifest.id().to_string();
            desired.insert(pod_id, result.manifest);
        }

        for (pod_id, manifest) in &desired {
            match workers.get(pod_id) {
                Some(handle) => {
                    if !handle.send_manifest(manifest.clone()) {
                        // The worker died; replace it.
                        warn!(self.log, "respawning dead worker"; "pod" => pod_id);
                        workers.insert(
                            pod_id.clone(),
                            self.spawn(pod_id, manifest.clone()),
                        );
                    }
                }
                None => {
                    info!(self.log, "starting worker"; "pod" => pod_id);
                    workers.insert(
                        pod_id.clone(),
                        self.spawn(pod_id, manifest.clone()),
                    );
                }
            }
        }

        let gone: Vec<String> = workers
            .keys()
            .filter(|pod_id| !desired.contains_key(*pod_id))
            .cloned()
            .collect();
        for pod_id in gone {
            info!(self.log, "intent disappeared; stopping worker"; "pod" => &pod_id);
            if let Some(handle) = workers.remove(&pod_id) {
                handle.signal_quit();
                // The worker halts its pod and exits on its own time.
                drop(handle.into_join());
            }
        }
    }

    fn spawn(&self, pod_id: &str, manifest: Manifest) -> WorkerHandle {
        let pod = Arc::new(Pod::at(
            &self.pod_root,
            pod_id,
            self.pod_deps.clone(),
        ));
        spawn_worker(
            pod_id,
            pod,
            self.reality.clone(),
            self.hooks.clone(),
            manifest,
            &self.log,
        )
    }

    async fn shutdown_workers(
        &self,
        workers: BTreeMap<String, WorkerHandle>,
    ) {
        info!(self.log, "shutting down workers"; "count" => workers.len());
        let mut joins = Vec::with_capacity(workers.len());
        for (_, handle) in workers {
            handle.signal_quit();
            joins.push(handle.into_join());
        }
        for join in joins {
            if let Err(err) = join.await {
                warn!(
                    self.log,
                    "worker task panicked during shutdown";
                    "error" => err.to_string(),
                );
            }
        }
    }
}
