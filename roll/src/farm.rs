// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The roll farm: one controller task per live update.
//!
//! The farm owns a session and watches the roll tree. Updates that
//! appear get a controller; updates that vanish get their task
//! cancelled (external deletion is an abort, not an error). A stalled
//! update is simply dropped from the running set and picked up again on
//! the next reconcile tick. Losing the session aborts every controller
//! and surfaces to the caller, who re-establishes and runs a new farm.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use slog::{Logger, info, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::rc::{RcId, Update};
use stevedore_kv::health::HealthStore;
use stevedore_kv::rc_store::ConsulRcStore;
use stevedore_kv::roll_store::ConsulRollStore;
use stevedore_kv::session::SessionHandle;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::controller::{
    RollConfig, RollController, RollError, RollOutcome,
};

/// How often the farm re-reconciles even without a watch emission;
/// this is what retries stalled updates.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    #[error("roll watch stream closed unexpectedly")]
    WatchClosed,

    #[error("session lost; re-establish and run a new farm")]
    SessionLost,
}

struct RunningRoll {
    quit_tx: watch::Sender<bool>,
}

pub struct Farm {
    rcs: Arc<ConsulRcStore>,
    rolls: Arc<ConsulRollStore>,
    health: Arc<HealthStore>,
    config: RollConfig,
    log: Logger,
}

impl Farm {
    pub fn new(
        rcs: ConsulRcStore,
        rolls: ConsulRollStore,
        health: HealthStore,
        config: RollConfig,
        log: &Logger,
    ) -> Farm {
        Farm {
            rcs: Arc::new(rcs),
            rolls: Arc::new(rolls),
            health: Arc::new(health),
            config,
            log: log.new(o!("component" => "RollFarm")),
        }
    }

    /// Run under `session` until quit or session loss.
    pub async fn run(
        &self,
        session: SessionHandle,
        mut quit: watch::Receiver<bool>,
    ) -> Result<(), FarmError> {
        let controller = Arc::new(RollController::new(
            self.rcs.clone(),
            self.rolls.clone(),
            self.health.clone(),
            session.clone(),
            self.config.clone(),
            &self.log,
        ));

        let mut snapshots = self.rolls.watch_all(quit.clone());
        let mut session_lost = session.lost_signal();
        let (done_tx, mut done_rx) =
            mpsc::channel::<(RcId, Result<RollOutcome, RollError>)>(16);
        let mut running: BTreeMap<RcId, RunningRoll> = BTreeMap::new();
        let mut last_seen: Vec<Update> = Vec::new();
        let mut reconcile_tick = tokio::time::interval(RECONCILE_INTERVAL);
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = quit.changed() => {
                    self.cancel_all(&mut running);
                    return Ok(());
                }
                _ = session_lost.changed() => {
                    warn!(self.log, "session lost; aborting all rolls");
                    self.cancel_all(&mut running);
                    return Err(FarmError::SessionLost);
                }
                Some((id, outcome)) = done_rx.recv() => {
                    running.remove(&id);
                    match outcome {
                        Ok(outcome) => {
                            info!(
                                self.log,
                                "roll finished";
                                "new_rc" => id.to_string(),
                                "outcome" => ?outcome,
                            );
                        }
                        Err(err) => {
                            warn!(
                                self.log,
                                "roll failed";
                                "new_rc" => id.to_string(),
                                "error" => InlineErrorChain::new(&err),
                            );
                        }
                    }
                }
                snapshot = snapshots.recv() => {
                    match snapshot {
                        None => {
                            self.cancel_all(&mut running);
                            return Err(FarmError::WatchClosed);
                        }
                        Some(snapshot) => {
                            last_seen = snapshot;
                            self.reconcile(
                                &controller,
                                &mut running,
                                &last_seen,
                                &done_tx,
                            );
                        }
                    }
                }
                _ = reconcile_tick.tick() => {
                    self.reconcile(
                        &controller,
                        &mut running,
                        &last_seen,
                        &done_tx,
                    );
                }
            }
        }
    }

    fn reconcile(
        &self,
        controller: &Arc<
            RollController<ConsulRcStore, ConsulRollStore, HealthStore>,
        >,
        running: &mut BTreeMap<RcId, RunningRoll>,
        updates: &[Update],
        done_tx: &mpsc::Sender<(RcId, Result<RollOutcome, RollError>)>,
    ) {
        for update in updates {
            if running.contains_key(&update.new_rc) {
                continue;
            }
            info!(
                self.log,
                "starting roll";
                "new_rc" => update.new_rc.to_string(),
                "old_rc" => update.old_rc.to_string(),
            );
            let (quit_tx, quit_rx) = watch::channel(false);
            let task_controller = controller.clone();
            let task_update = update.clone();
            let task_done = done_tx.clone();
            tokio::spawn(async move {
                let outcome =
                    task_controller.run(&task_update, quit_rx).await;
                let _ = task_done
                    .send((task_update.new_rc.clone(), outcome))
                    .await;
            });
            running.insert(update.new_rc.clone(), RunningRoll { quit_tx });
        }

        // An update deleted externally is an abort for its controller.
        let live: std::collections::BTreeSet<&RcId> =
            updates.iter().map(|update| &update.new_rc).collect();
        let gone: Vec<RcId> = running
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        for id in gone {
            info!(
                self.log,
                "update deleted externally; aborting roll";
                "new_rc" => id.to_string(),
            );
            if let Some(roll) = running.remove(&id) {
                let _ = roll.quit_tx.send(true);
            }
        }
    }

    fn cancel_all(&self, running: &mut BTreeMap<RcId, RunningRoll>) {
        for (_, roll) in std::mem::take(running) {
            let _ = roll.quit_tx.send(true);
        }
    }
}
