// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Health tree access: session-bound writes from the node-local health
//! watcher, fleet-wide reads for controllers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use slog::{Logger, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::health::HealthResult;

use crate::client::KvClient;
use crate::error::KvError;
use crate::paths;
use crate::session::SessionHandle;

/// Fleet-wide health as of one read: node name to that node's latest
/// verdict for the pod.
pub type ServiceHealth = BTreeMap<String, HealthResult>;

/// Read access to the health tree; the seam the roll controller
/// consumes, so tests can substitute canned fleets.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn service_health(&self, pod: &str)
    -> Result<ServiceHealth, KvError>;
}

#[derive(Clone, Debug)]
pub struct HealthStore {
    client: KvClient,
    log: Logger,
}

impl HealthStore {
    pub fn new(client: KvClient, log: &Logger) -> HealthStore {
        HealthStore {
            client,
            log: log.new(o!("component" => "HealthStore")),
        }
    }
}

#[async_trait]
impl HealthChecker for HealthStore {
    async fn service_health(
        &self,
        pod: &str,
    ) -> Result<ServiceHealth, KvError> {
        let prefix = paths::health_prefix(pod);
        let (pairs, _) = self
            .client
            .list(&prefix, 0, std::time::Duration::ZERO)
            .await?;
        let mut fleet = BTreeMap::new();
        for pair in pairs {
            match serde_json::from_slice::<HealthResult>(&pair.value) {
                Ok(result) => {
                    fleet.insert(result.node.clone(), result);
                }
                Err(err) => {
                    warn!(
                        self.log,
                        "skipping undecodable health entry";
                        "path" => &pair.key,
                        "error" => InlineErrorChain::new(&err),
                    );
                }
            }
        }
        Ok(fleet)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthUpdateError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("failed to encode health result for {pod}/{node}")]
    Encode {
        pod: String,
        node: String,
        #[source]
        err: serde_json::Error,
    },

    #[error("health key {key:?} is held by another session")]
    Contended { key: String },
}

/// Session-scoped writer for one node's health entries. Entries die
/// with the session, so a crashed writer's verdicts silently expire.
#[derive(Clone, Debug)]
pub struct HealthUpdater {
    client: KvClient,
    session: SessionHandle,
    log: Logger,
}

impl HealthUpdater {
    pub fn new(
        client: KvClient,
        session: SessionHandle,
        log: &Logger,
    ) -> HealthUpdater {
        HealthUpdater {
            client,
            session,
            log: log.new(o!("component" => "HealthUpdater")),
        }
    }

    pub async fn put_health(
        &self,
        result: &HealthResult,
    ) -> Result<(), HealthUpdateError> {
        if self.session.is_lost() {
            return Err(KvError::SessionExpired {
                session: self.session.id().to_string(),
            }
            .into());
        }
        let key = paths::health_path(&result.pod, &result.node);
        let encoded = serde_json::to_vec(result).map_err(|err| {
            HealthUpdateError::Encode {
                pod: result.pod.clone(),
                node: result.node.clone(),
                err,
            }
        })?;
        let acquired = self
            .client
            .acquire(&key, encoded, self.session.id())
            .await?;
        if !acquired {
            // Another node's session holds our key; that means two
            // watchers believe they own the same node name.
            warn!(self.log, "health key contended"; "key" => &key);
            return Err(HealthUpdateError::Contended { key });
        }
        Ok(())
    }
}
