// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replication controllers and the roll records that move replicas
//! between them.
//!
//! RCs are not owned by this system; the roll controller mutates their
//! desired replica counts through the KV store and nothing else.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

/// Identifier of a replication controller. Also keys `Update` records:
/// an update is addressed by its *new* RC's id.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct RcId(pub String);

impl RcId {
    pub fn new<S: Into<String>>(s: S) -> RcId {
        RcId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External record describing how many replicas of a pod should exist
/// across the fleet and where they may land.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationController {
    pub id: RcId,
    pub manifest: Manifest,
    /// Opaque selector consumed by schedulers; carried, never
    /// interpreted here.
    pub node_selector: String,
    pub replicas_desired: i64,
}

/// Immutable plan to move replicas from `old_rc` to `new_rc` while
/// keeping at least `minimum_replicas` healthy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub old_rc: RcId,
    pub new_rc: RcId,
    pub desired_replicas: i64,
    pub minimum_replicas: i64,
}
