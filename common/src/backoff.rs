// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.
//!
//! Every loosely-coupled peer in this system (the KV store, artifact
//! servers, the service supervisor) can fail transiently; these policies
//! are the shared vocabulary for how hard each caller leans on a peer
//! while it recovers.

use std::time::Duration;

pub use ::backoff::Error as BackoffError;
pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::{ExponentialBackoff, Notify, backoff::Backoff};

/// Return a backoff policy for talking to the KV store.
///
/// Retries start fast but back off far enough to avoid hammering a KV
/// server that is restarting or partitioned away.
pub fn retry_policy_kv() -> ::backoff::ExponentialBackoff {
    backoff_builder()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_interval(Duration::from_secs(60))
        .build()
}

/// Return the backoff policy used by per-pod workers between failed
/// attempts to apply a manifest.
///
/// The interval runs from one second up to thirty, with a quarter of
/// jitter so that a node full of failing pods does not retry in
/// lockstep.
pub fn retry_policy_pod_worker() -> ::backoff::ExponentialBackoff {
    backoff_builder()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(30))
        .with_randomization_factor(0.25)
        .build()
}

/// Return a backoff policy for querying node-local conditions.
///
/// The max interval is very small; this is only appropriate when
/// repeating the request cannot overload whatever is being queried.
pub fn retry_policy_local() -> ::backoff::ExponentialBackoff {
    backoff_builder()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .build()
}

fn backoff_builder() -> ::backoff::ExponentialBackoffBuilder {
    let mut builder = ::backoff::ExponentialBackoffBuilder::new();
    builder.with_multiplier(2.0).with_max_elapsed_time(None);
    builder
}
