// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The health watcher: scores this node's pods for the fleet.
//!
//! The reality tree says which pods are supposed to be running here;
//! every pod with a status port gets a monitor task that probes
//! `https://<node>:<port>/_status` and writes the verdict to the health
//! tree through the session-bound updater. When a pod leaves reality
//! (or changes identity) its monitor is torn down; when the session
//! dies, every verdict this node ever wrote expires with it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::health::{HealthResult, HealthState};
use stevedore_kv::health::HealthUpdater;
use stevedore_kv::pod_store::{ManifestResult, PodStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How often the reality tree is re-listed.
pub const REALITY_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How often each pod's status endpoint is probed.
pub const HEALTHCHECK_INTERVAL: Duration = Duration::from_millis(2000);

/// Probe timeout; a status endpoint slower than this is Critical.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One monitored pod: how we knew it last, and the monitor serving it.
struct PodWatch {
    fingerprint: String,
    quit_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

pub struct HealthWatcher {
    node: String,
    reality: PodStore,
    updater: HealthUpdater,
    probe: StatusProbe,
    log: Logger,
}

impl HealthWatcher {
    pub fn new(
        node: &str,
        reality: PodStore,
        updater: HealthUpdater,
        log: &Logger,
    ) -> HealthWatcher {
        let log = log.new(o!("component" => "HealthWatcher"));
        HealthWatcher {
            node: node.to_string(),
            reality,
            updater,
            probe: StatusProbe::new(&log),
            log,
        }
    }

    pub async fn run(self, mut quit: watch::Receiver<bool>) {
        let mut watches: BTreeMap<String, PodWatch> = BTreeMap::new();
        let mut interval = tokio::time::interval(REALITY_POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = interval.tick() => {
                    let reality = match self.reality.list_pods(&self.node).await {
                        Ok(reality) => reality,
                        Err(err) => {
                            warn!(
                                self.log,
                                "failed to list reality; keeping monitors";
                                "error" => InlineErrorChain::new(&err),
                            );
                            continue;
                        }
                    };
                    self.reconcile(&mut watches, &reality);
                }
            }
        }

        for (_, watch) in watches {
            let _ = watch.quit_tx.send(true);
            if let Some(join) = watch.join {
                let _ = join.await;
            }
        }
    }

    fn reconcile(
        &self,
        watches: &mut BTreeMap<String, PodWatch>,
        reality: &[ManifestResult],
    ) {
        let plan = plan_watches(
            &watches
                .iter()
                .map(|(path, watch)| (path.clone(), watch.fingerprint.clone()))
                .collect(),
            reality,
        );

        for path in plan.remove {
            if let Some(watch) = watches.remove(&path) {
                info!(self.log, "stopping monitor"; "path" => &path);
                let _ = watch.quit_tx.send(true);
            }
        }

        for result in plan.add {
            let Some(port) = result.manifest.status_port() else {
                // No status port, nothing to probe; remember the pod so
                // we do not reconsider it every tick.
                debug!(
                    self.log,
                    "pod has no status port; not monitoring";
                    "pod" => result.manifest.id(),
                );
                watches.insert(
                    result.path.clone(),
                    PodWatch {
                        fingerprint: fingerprint_of(&result),
                        quit_tx: watch::channel(false).0,
                        join: None,
                    },
                );
                continue;
            };

            info!(
                self.log,
                "starting monitor";
                "pod" => result.manifest.id(),
                "port" => port,
            );
            let (quit_tx, quit_rx) = watch::channel(false);
            let join = tokio::spawn(monitor_health(
                self.node.clone(),
                result.manifest.id().to_string(),
                port,
                self.probe.clone(),
                self.updater.clone(),
                quit_rx,
                self.log.new(o!("pod" => result.manifest.id().to_string())),
            ));
            watches.insert(
                result.path.clone(),
                PodWatch {
                    fingerprint: fingerprint_of(&result),
                    quit_tx,
                    join: Some(join),
                },
            );
        }
    }
}

pub(crate) struct WatchPlan {
    pub remove: Vec<String>,
    pub add: Vec<ManifestResult>,
}

/// Diff the monitored set against reality, keyed by KV path. A pod
/// whose manifest identity changed shows up in both lists: the old
/// monitor dies and a fresh one starts against the new manifest.
pub(crate) fn plan_watches(
    current: &BTreeMap<String, String>,
    reality: &[ManifestResult],
) -> WatchPlan {
    let reality_by_path: BTreeMap<&str, &ManifestResult> = reality
        .iter()
        .map(|result| (result.path.as_str(), result))
        .collect();

    let mut remove = Vec::new();
    for (path, fingerprint) in current {
        match reality_by_path.get(path.as_str()) {
            None => remove.push(path.clone()),
            Some(&result) if fingerprint_of(result) != *fingerprint => {
                remove.push(path.clone());
            }
            Some(_) => {}
        }
    }

    let mut add = Vec::new();
    for result in reality {
        let changed = match current.get(&result.path) {
            None => true,
            Some(fingerprint) => fingerprint_of(result) != *fingerprint,
        };
        if changed {
            add.push(result.clone());
        }
    }

    WatchPlan { remove, add }
}

fn fingerprint_of(result: &ManifestResult) -> String {
    result
        .manifest
        .fingerprint()
        .unwrap_or_else(|_| format!("unfingerprintable-{}", result.modify_index))
}

async fn monitor_health(
    node: String,
    pod: String,
    port: u16,
    probe: StatusProbe,
    updater: HealthUpdater,
    mut quit: watch::Receiver<bool>,
    log: Logger,
) {
    let mut interval = tokio::time::interval(HEALTHCHECK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = interval.tick() => {
                let result = probe.check(&node, &pod, port).await;
                debug!(log, "health probe"; "status" => ?result.status);
                if let Err(err) = updater.put_health(&result).await {
                    warn!(
                        log,
                        "failed to publish health result";
                        "error" => InlineErrorChain::new(&err),
                    );
                }
            }
        }
    }
}

/// The HTTPS status probe. Status endpoints are node-local and
/// self-signed, so certificate verification is off.
#[derive(Clone)]
pub struct StatusProbe {
    client: reqwest::Client,
}

impl StatusProbe {
    fn new(_log: &Logger) -> StatusProbe {
        StatusProbe {
            client: reqwest::ClientBuilder::new()
                .danger_accept_invalid_certs(true)
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap(),
        }
    }

    /// Probe one pod's status endpoint and classify:
    /// 2xx is Passing, 429 is Warning, anything else (including
    /// transport failure) is Critical.
    pub async fn check(
        &self,
        node: &str,
        pod: &str,
        port: u16,
    ) -> HealthResult {
        let url = format!("https://{node}:{port}/_status");
        let (status, output) = match self.client.get(&url).send().await {
            Ok(resp) => {
                let code = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let mut output =
                    format!("HTTP GET {url}: {code} Output: {body}");
                output.truncate(1024);
                let status = if code.is_success() {
                    HealthState::Passing
                } else if code == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    HealthState::Warning
                } else {
                    HealthState::Critical
                };
                (status, output)
            }
            Err(err) => (
                HealthState::Critical,
                format!("HTTP GET {url} failed: {err}"),
            ),
        };
        HealthResult {
            pod: pod.to_string(),
            node: node.to_string(),
            status,
            output,
            modified_at: Utc::now(),
        }
    }
}
