// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Long-poll watch over a KV prefix.
//!
//! The loop holds the last seen index, issues blocking lists against
//! it, and emits the complete current set on every successful response.
//! Downstream reconcilers are structured to tolerate replays, so a
//! wait-expiry response that carries the same set is emitted like any
//! other. Transient failures back off; the loop only exits on quit or
//! when the receiver goes away.

use std::time::Duration;

use slog::{Logger, debug, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::backoff::{self, Backoff};
use tokio::sync::{mpsc, watch};

use crate::client::{KvClient, KvPair};

/// How long the server may hold a blocking list before returning the
/// unchanged set.
pub const WATCH_WAIT: Duration = Duration::from_secs(60);

/// Capacity of the emission channel. A full channel means the consumer
/// is behind; the watch blocks rather than dropping snapshots, since a
/// snapshot's replacement has not been observed yet.
const WATCH_CHANNEL_CAPACITY: usize = 8;

/// One emission: the complete set under the prefix at `index`.
#[derive(Clone, Debug)]
pub struct WatchBatch {
    pub pairs: Vec<KvPair>,
    pub index: u64,
}

/// Spawn a watch on `prefix`. Emissions carry the full current set.
pub fn watch_prefix(
    client: KvClient,
    prefix: String,
    mut quit: watch::Receiver<bool>,
    log: &Logger,
) -> mpsc::Receiver<WatchBatch> {
    let log = log.new(o!("component" => "KvWatch", "prefix" => prefix.clone()));
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut index = 0u64;
        let mut retry = backoff::retry_policy_kv();
        loop {
            if *quit.borrow() {
                return;
            }
            let batch = tokio::select! {
                _ = quit.changed() => return,
                // Dropping the in-flight request aborts the blocking
                // list server-side; that is the cancellation path.
                result = client.list(&prefix, index, WATCH_WAIT) => {
                    match result {
                        Ok((pairs, new_index)) => {
                            retry.reset();
                            index = new_index;
                            WatchBatch { pairs, index: new_index }
                        }
                        Err(err) => {
                            warn!(
                                log,
                                "list failed; backing off";
                                "error" => InlineErrorChain::new(&err),
                            );
                            let delay = retry
                                .next_backoff()
                                .unwrap_or(Duration::from_secs(60));
                            tokio::select! {
                                _ = quit.changed() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            continue;
                        }
                    }
                }
            };
            debug!(log, "emitting snapshot"; "index" => batch.index, "entries" => batch.pairs.len());
            tokio::select! {
                _ = quit.changed() => return,
                sent = tx.send(batch) => {
                    if sent.is_err() {
                        // Receiver dropped; nobody is watching anymore.
                        return;
                    }
                }
            }
        }
    });

    rx
}
