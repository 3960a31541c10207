// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to the intent and reality trees.
//!
//! Both trees hold YAML manifests keyed `<tree>/<node>/<podId>`. Intent
//! is written by external planners and consumed by preparers; reality
//! is written by preparers and consumed by anything that wants to know
//! what a node is actually running.

use slog::{Logger, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::manifest::{Manifest, ManifestError};
use tokio::sync::{mpsc, watch};

use crate::client::{KvClient, KvPair};
use crate::error::KvError;
use crate::paths;
use crate::watch::watch_prefix;

/// Capacity of a pod watch's error channel. Errors are advisory;
/// when the consumer lags they are dropped rather than stalling the
/// snapshot stream.
const ERROR_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodTree {
    Intent,
    Reality,
}

impl PodTree {
    pub fn prefix(&self) -> &'static str {
        match self {
            PodTree::Intent => paths::INTENT_TREE,
            PodTree::Reality => paths::REALITY_TREE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PodStoreError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("unparseable manifest at {path:?}")]
    Manifest {
        path: String,
        #[source]
        err: ManifestError,
    },
}

/// One manifest as stored, with enough context to act on it.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestResult {
    pub path: String,
    pub manifest: Manifest,
    pub modify_index: u64,
}

#[derive(Clone, Debug)]
pub struct PodStore {
    client: KvClient,
    tree: PodTree,
    log: Logger,
}

impl PodStore {
    pub fn new(client: KvClient, tree: PodTree, log: &Logger) -> PodStore {
        let log = log.new(o!(
            "component" => "PodStore",
            "tree" => tree.prefix(),
        ));
        PodStore { client, tree, log }
    }

    /// List every pod manifest for `node`. Unparseable entries are
    /// logged and skipped; one corrupt manifest must not hide the rest
    /// of the node's pods.
    pub async fn list_pods(
        &self,
        node: &str,
    ) -> Result<Vec<ManifestResult>, PodStoreError> {
        let prefix = paths::node_prefix(self.tree.prefix(), node);
        let (pairs, _) = self
            .client
            .list(&prefix, 0, std::time::Duration::ZERO)
            .await?;
        let mut results = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match decode_pair(&pair) {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(
                        self.log,
                        "skipping unparseable manifest";
                        "path" => &pair.key,
                        "error" => InlineErrorChain::new(&err),
                    );
                }
            }
        }
        Ok(results)
    }

    /// Publish `manifest` for `node`, replacing any previous entry, and
    /// return the entry's new ModifyIndex.
    pub async fn set_pod(
        &self,
        node: &str,
        manifest: &Manifest,
    ) -> Result<u64, PodStoreError> {
        let key = paths::pod_path(self.tree.prefix(), node, manifest.id());
        let encoded = manifest.to_yaml().map_err(|err| {
            PodStoreError::Manifest { path: key.clone(), err }
        })?;
        self.client.put(&key, encoded.into_bytes()).await?;
        let (_, index) = self.client.get(&key).await?.ok_or_else(|| {
            KvError::UnexpectedResponse {
                verb: "put",
                key: key.clone(),
                detail: "entry missing immediately after put".to_string(),
            }
        })?;
        Ok(index)
    }

    pub async fn delete_pod(
        &self,
        node: &str,
        pod: &str,
    ) -> Result<(), PodStoreError> {
        let key = paths::pod_path(self.tree.prefix(), node, pod);
        Ok(self.client.delete(&key).await?)
    }

    /// Watch every pod manifest for `node`. Snapshot emissions carry
    /// the complete current set; decode failures go to the error
    /// channel and the offending entry is skipped.
    pub fn watch_pods(
        &self,
        node: &str,
        quit: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<Vec<ManifestResult>>, mpsc::Receiver<PodStoreError>)
    {
        let prefix = paths::node_prefix(self.tree.prefix(), node);
        let mut batches =
            watch_prefix(self.client.clone(), prefix, quit, &self.log);
        let (out_tx, out_rx) = mpsc::channel(8);
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let log = self.log.clone();
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                let mut results = Vec::with_capacity(batch.pairs.len());
                for pair in batch.pairs {
                    match decode_pair(&pair) {
                        Ok(result) => results.push(result),
                        Err(err) => {
                            warn!(
                                log,
                                "skipping unparseable manifest";
                                "path" => &pair.key,
                                "error" => InlineErrorChain::new(&err),
                            );
                            let _ = err_tx.try_send(err);
                        }
                    }
                }
                if out_tx.send(results).await.is_err() {
                    return;
                }
            }
        });

        (out_rx, err_rx)
    }
}

fn decode_pair(pair: &KvPair) -> Result<ManifestResult, PodStoreError> {
    let manifest = Manifest::from_slice(&pair.value).map_err(|err| {
        PodStoreError::Manifest { path: pair.key.clone(), err }
    })?;
    Ok(ManifestResult {
        path: pair.key.clone(),
        manifest,
        modify_index: pair.modify_index,
    })
}
