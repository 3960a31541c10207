// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Health results published by per-node health watchers and consumed by
//! the rolling update controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of one health probe.
///
/// Variants are ordered worst-to-best so that `max`/`min` comparisons
/// read naturally: `Critical < Unknown < Warning < Passing`.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Critical,
    Unknown,
    Warning,
    Passing,
}

impl HealthState {
    pub fn is_passing(&self) -> bool {
        *self == HealthState::Passing
    }
}

/// One node's latest verdict on one pod, written to
/// `health/<pod>/<node>` under a TTL-bearing session so that a crashed
/// writer's entries expire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub pod: String,
    pub node: String,
    pub status: HealthState,
    pub output: String,
    pub modified_at: DateTime<Utc>,
}
