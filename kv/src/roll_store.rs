// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to roll records.
//!
//! Updates are immutable and keyed by their new RC's id: creation is a
//! CAS against index zero, so a second planner publishing the same roll
//! is told so instead of overwriting. The roll farm consumes the tree
//! through a watch and deletes each update when its roll completes.

use slog::{Logger, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::rc::{RcId, Update};
use tokio::sync::{mpsc, watch};

use crate::client::KvClient;
use crate::error::KvError;
use crate::paths;
use crate::watch::watch_prefix;

#[derive(Debug, thiserror::Error)]
pub enum RollStoreError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("undecodable roll record at {key:?}")]
    Decode {
        key: String,
        #[source]
        err: serde_json::Error,
    },

    #[error("an update for new RC {id} already exists")]
    AlreadyExists { id: RcId },
}

/// The subset of roll-store operations the controller needs; the farm
/// additionally watches via the concrete [`ConsulRollStore`].
#[async_trait::async_trait]
pub trait RollStore: Send + Sync {
    async fn get(&self, id: &RcId) -> Result<Option<Update>, RollStoreError>;

    /// Publish an update. Updates are immutable: if one already exists
    /// for this new-RC id, this fails.
    async fn put(&self, update: &Update) -> Result<(), RollStoreError>;

    async fn delete(&self, id: &RcId) -> Result<(), RollStoreError>;
}

#[derive(Clone, Debug)]
pub struct ConsulRollStore {
    client: KvClient,
    log: Logger,
}

impl ConsulRollStore {
    pub fn new(client: KvClient, log: &Logger) -> ConsulRollStore {
        ConsulRollStore {
            client,
            log: log.new(o!("component" => "RollStore")),
        }
    }

    /// Watch the whole roll tree. Each emission is the complete set of
    /// live updates; undecodable records are logged and skipped.
    pub fn watch_all(
        &self,
        quit: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Vec<Update>> {
        let mut batches = watch_prefix(
            self.client.clone(),
            paths::ROLL_TREE.to_string(),
            quit,
            &self.log,
        );
        let (tx, rx) = mpsc::channel(8);
        let log = self.log.clone();
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                let mut updates = Vec::with_capacity(batch.pairs.len());
                for pair in batch.pairs {
                    match serde_json::from_slice::<Update>(&pair.value) {
                        Ok(update) => updates.push(update),
                        Err(err) => {
                            warn!(
                                log,
                                "skipping undecodable roll record";
                                "path" => &pair.key,
                                "error" => InlineErrorChain::new(&err),
                            );
                        }
                    }
                }
                if tx.send(updates).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

#[async_trait::async_trait]
impl RollStore for ConsulRollStore {
    async fn get(&self, id: &RcId) -> Result<Option<Update>, RollStoreError> {
        let key = paths::roll_path(id);
        match self.client.get(&key).await? {
            None => Ok(None),
            Some((value, _)) => {
                let update = serde_json::from_slice(&value)
                    .map_err(|err| RollStoreError::Decode { key, err })?;
                Ok(Some(update))
            }
        }
    }

    async fn put(&self, update: &Update) -> Result<(), RollStoreError> {
        let key = paths::roll_path(&update.new_rc);
        let encoded = serde_json::to_vec(update).map_err(|err| {
            RollStoreError::Decode { key: key.clone(), err }
        })?;
        match self.client.cas(&key, encoded, 0).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() => Err(
                RollStoreError::AlreadyExists { id: update.new_rc.clone() },
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, id: &RcId) -> Result<(), RollStoreError> {
        let key = paths::roll_path(id);
        Ok(self.client.delete(&key).await?)
    }
}
