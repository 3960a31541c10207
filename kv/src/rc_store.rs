// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to replication controller records.
//!
//! RCs are external records; the only mutation this system performs is
//! replica-count shifts, and those always go through CAS so concurrent
//! controllers cannot silently clobber each other.

use async_trait::async_trait;
use slog::{Logger, debug, o};
use stevedore_common::rc::{RcId, ReplicationController};

use crate::client::KvClient;
use crate::error::KvError;
use crate::paths;

/// Bound on read-CAS-retry attempts in [`ConsulRcStore::add_desired_replicas`].
const CAS_RETRY_LIMIT: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum RcStoreError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("undecodable RC record at {key:?}")]
    Decode {
        key: String,
        #[source]
        err: serde_json::Error,
    },

    #[error("failed to encode RC record {id}")]
    Encode {
        id: RcId,
        #[source]
        err: serde_json::Error,
    },

    #[error("RC {id} already exists")]
    AlreadyExists { id: RcId },

    #[error("gave up compare-and-swapping RC {id} after {attempts} attempts")]
    CasExhausted { id: RcId, attempts: usize },
}

impl RcStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RcStoreError::Kv(err) if err.is_conflict())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RcStoreError::Kv(err) if err.is_transient())
    }
}

/// An RC record plus the ModifyIndex it was read at, for CAS writes.
#[derive(Clone, Debug)]
pub struct VersionedRc {
    pub rc: ReplicationController,
    pub modify_index: u64,
}

/// The seam the roll controller drives. The KV-backed implementation is
/// [`ConsulRcStore`]; tests substitute in-memory fleets.
#[async_trait]
pub trait RcStore: Send + Sync {
    async fn get(&self, id: &RcId) -> Result<VersionedRc, RcStoreError>;

    /// Replace the RC record, succeeding only if it is unchanged since
    /// it was read at `expected_index`.
    async fn cas(
        &self,
        rc: &ReplicationController,
        expected_index: u64,
    ) -> Result<(), RcStoreError>;

    /// Take the RC's lock. False means someone else holds it.
    async fn lock(
        &self,
        id: &RcId,
        session: &str,
    ) -> Result<bool, RcStoreError>;

    async fn unlock(
        &self,
        id: &RcId,
        session: &str,
    ) -> Result<(), RcStoreError>;
}

#[derive(Clone, Debug)]
pub struct ConsulRcStore {
    client: KvClient,
    log: Logger,
}

impl ConsulRcStore {
    pub fn new(client: KvClient, log: &Logger) -> ConsulRcStore {
        ConsulRcStore {
            client,
            log: log.new(o!("component" => "RcStore")),
        }
    }

    /// Create a new RC record; the key must not already exist.
    pub async fn create(
        &self,
        rc: &ReplicationController,
    ) -> Result<(), RcStoreError> {
        let key = paths::rc_path(&rc.id);
        let encoded = serde_json::to_vec(rc).map_err(|err| {
            RcStoreError::Encode { id: rc.id.clone(), err }
        })?;
        match self.client.cas(&key, encoded, 0).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() => {
                Err(RcStoreError::AlreadyExists { id: rc.id.clone() })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Set the desired replica count outright, retrying CAS races a
    /// bounded number of times.
    pub async fn set_desired_replicas(
        &self,
        id: &RcId,
        replicas: i64,
    ) -> Result<(), RcStoreError> {
        self.rewrite_replicas(id, |_| replicas).await.map(|_| ())
    }

    /// Adjust the desired replica count by `delta`, clamped at zero.
    /// Returns the count as written.
    pub async fn add_desired_replicas(
        &self,
        id: &RcId,
        delta: i64,
    ) -> Result<i64, RcStoreError> {
        self.rewrite_replicas(id, |current| current + delta).await
    }

    async fn rewrite_replicas<F: Fn(i64) -> i64>(
        &self,
        id: &RcId,
        next: F,
    ) -> Result<i64, RcStoreError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let VersionedRc { mut rc, modify_index } = self.get(id).await?;
            rc.replicas_desired = next(rc.replicas_desired).max(0);
            match self.cas(&rc, modify_index).await {
                Ok(()) => {
                    debug!(
                        self.log,
                        "rewrote desired replicas";
                        "rc" => id.to_string(),
                        "replicas" => rc.replicas_desired,
                    );
                    return Ok(rc.replicas_desired);
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(RcStoreError::CasExhausted {
            id: id.clone(),
            attempts: CAS_RETRY_LIMIT,
        })
    }
}

#[async_trait]
impl RcStore for ConsulRcStore {
    async fn get(&self, id: &RcId) -> Result<VersionedRc, RcStoreError> {
        let key = paths::rc_path(id);
        let (value, modify_index) = self
            .client
            .get(&key)
            .await?
            .ok_or(KvError::NotFound { key: key.clone() })?;
        let rc = serde_json::from_slice(&value)
            .map_err(|err| RcStoreError::Decode { key, err })?;
        Ok(VersionedRc { rc, modify_index })
    }

    async fn cas(
        &self,
        rc: &ReplicationController,
        expected_index: u64,
    ) -> Result<(), RcStoreError> {
        let key = paths::rc_path(&rc.id);
        let encoded = serde_json::to_vec(rc).map_err(|err| {
            RcStoreError::Encode { id: rc.id.clone(), err }
        })?;
        Ok(self.client.cas(&key, encoded, expected_index).await?)
    }

    async fn lock(
        &self,
        id: &RcId,
        session: &str,
    ) -> Result<bool, RcStoreError> {
        let key = paths::lock_path(&paths::rc_path(id));
        Ok(self
            .client
            .acquire(&key, session.as_bytes().to_vec(), session)
            .await?)
    }

    async fn unlock(
        &self,
        id: &RcId,
        session: &str,
    ) -> Result<(), RcStoreError> {
        let key = paths::lock_path(&paths::rc_path(id));
        Ok(self.client.release(&key, session).await?)
    }
}
