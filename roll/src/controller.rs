// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of a single rolling update.
//!
//! The controller locks both RCs, then repeatedly: reads their current
//! state, counts healthy replicas of the pod across the fleet, computes
//! how many replicas may move this round without dropping below the
//! update's minimum, and applies the shift through CAS. Nothing about
//! progress is held in memory between rounds; a CAS conflict or a
//! restart simply recomputes from what the KV store says. An update
//! whose fleet cannot support any movement waits at one-second polls
//! until the stall timeout, then yields [`RollOutcome::Stalled`] so
//! the farm can retry later.

use std::sync::Arc;
use std::time::Duration;

use slog::{Logger, info, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::rc::Update;
use stevedore_kv::KvError;
use stevedore_kv::health::HealthChecker;
use stevedore_kv::rc_store::{RcStore, RcStoreError, VersionedRc};
use stevedore_kv::roll_store::{RollStore, RollStoreError};
use stevedore_kv::session::SessionHandle;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct RollConfig {
    /// How long to wait for health to improve before giving the update
    /// back to the farm.
    pub stall_timeout: Duration,
    /// How often health is re-polled while waiting.
    pub health_poll_interval: Duration,
}

impl Default for RollConfig {
    fn default() -> RollConfig {
        RollConfig {
            stall_timeout: Duration::from_secs(5 * 60),
            health_poll_interval: Duration::from_secs(1),
        }
    }
}

/// How one controller run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollOutcome {
    /// All replicas moved; the update record has been deleted.
    Completed,
    /// Another controller holds the locks; nothing was mutated.
    AlreadyOwned,
    /// Health never allowed progress within the stall timeout. The
    /// update record remains for a later retry.
    Stalled,
    /// Quit was signalled or the session died mid-roll. Locks are
    /// released (or expire with the session); no rollback.
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum RollError {
    #[error(transparent)]
    Rc(#[from] RcStoreError),

    #[error(transparent)]
    Roll(#[from] RollStoreError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

pub struct RollController<R, L, H> {
    rcs: Arc<R>,
    rolls: Arc<L>,
    health: Arc<H>,
    session: SessionHandle,
    config: RollConfig,
    log: Logger,
}

impl<R, L, H> RollController<R, L, H>
where
    R: RcStore,
    L: RollStore,
    H: HealthChecker,
{
    pub fn new(
        rcs: Arc<R>,
        rolls: Arc<L>,
        health: Arc<H>,
        session: SessionHandle,
        config: RollConfig,
        log: &Logger,
    ) -> RollController<R, L, H> {
        RollController {
            rcs,
            rolls,
            health,
            session,
            config,
            log: log.new(o!("component" => "RollController")),
        }
    }

    /// Drive `update` to completion (or a clean non-completion).
    pub async fn run(
        &self,
        update: &Update,
        quit: watch::Receiver<bool>,
    ) -> Result<RollOutcome, RollError> {
        let log = self.log.new(o!(
            "old_rc" => update.old_rc.to_string(),
            "new_rc" => update.new_rc.to_string(),
        ));

        // Both RC locks or nothing; contention means another roller
        // owns this update and we must not mutate anything.
        if !self.rcs.lock(&update.new_rc, self.session.id()).await? {
            info!(log, "new RC is locked elsewhere; standing down");
            return Ok(RollOutcome::AlreadyOwned);
        }
        if !self.rcs.lock(&update.old_rc, self.session.id()).await? {
            info!(log, "old RC is locked elsewhere; standing down");
            self.unlock(&update.new_rc, &log).await;
            return Ok(RollOutcome::AlreadyOwned);
        }

        let outcome = self.roll(update, quit, &log).await;

        if matches!(outcome, Ok(RollOutcome::Completed)) {
            // The update is consumed; delete it while still holding
            // the locks so no other roller resurrects it.
            if let Err(err) = self.rolls.delete(&update.new_rc).await {
                warn!(
                    log,
                    "completed but failed to delete update record";
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
        self.unlock(&update.old_rc, &log).await;
        self.unlock(&update.new_rc, &log).await;
        outcome
    }

    async fn roll(
        &self,
        update: &Update,
        mut quit: watch::Receiver<bool>,
        log: &Logger,
    ) -> Result<RollOutcome, RollError> {
        let mut stall_deadline: Option<tokio::time::Instant> = None;

        loop {
            if *quit.borrow() || self.session.is_lost() {
                return Ok(RollOutcome::Aborted);
            }

            let new = match self.rcs.get(&update.new_rc).await {
                Ok(new) => new,
                Err(err) if err.is_transient() => {
                    self.wait(&mut quit).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let old = match self.rcs.get(&update.old_rc).await {
                Ok(old) => old,
                Err(err) if err.is_transient() => {
                    self.wait(&mut quit).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if new.rc.replicas_desired >= update.desired_replicas
                && old.rc.replicas_desired == 0
            {
                info!(
                    log,
                    "roll complete";
                    "replicas" => new.rc.replicas_desired,
                );
                return Ok(RollOutcome::Completed);
            }

            let fleet = match self
                .health
                .service_health(new.rc.manifest.id())
                .await
            {
                Ok(fleet) => fleet,
                Err(err) if err.is_transient() => {
                    self.wait(&mut quit).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let healthy = fleet
                .values()
                .filter(|result| result.status.is_passing())
                .count() as i64;

            let headroom =
                healthy + old.rc.replicas_desired - update.minimum_replicas;
            let step = roll_step(
                headroom,
                update.desired_replicas,
                new.rc.replicas_desired,
                old.rc.replicas_desired,
            );

            if step.grow == 0 && step.shrink == 0 {
                // No movement is safe. Wait for health to improve, up
                // to the stall timeout.
                let deadline = *stall_deadline.get_or_insert_with(|| {
                    tokio::time::Instant::now() + self.config.stall_timeout
                });
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        log,
                        "no headroom within stall timeout";
                        "healthy" => healthy,
                        "minimum" => update.minimum_replicas,
                    );
                    return Ok(RollOutcome::Stalled);
                }
                self.wait(&mut quit).await;
                continue;
            }
            stall_deadline = None;

            info!(
                log,
                "shifting replicas";
                "grow" => step.grow,
                "shrink" => step.shrink,
                "healthy" => healthy,
                "new_desired" => new.rc.replicas_desired,
                "old_desired" => old.rc.replicas_desired,
            );

            if step.grow > 0 {
                if !self.cas_replicas(&new, step.grow, &mut quit, log).await? {
                    continue;
                }
            }
            if step.shrink > 0 {
                if !self
                    .cas_replicas(&old, -step.shrink, &mut quit, log)
                    .await?
                {
                    continue;
                }
            }
        }
    }

    /// Apply one replica-count delta via CAS. A conflict or transient
    /// failure returns false so the caller re-reads and recomputes.
    async fn cas_replicas(
        &self,
        observed: &VersionedRc,
        delta: i64,
        quit: &mut watch::Receiver<bool>,
        log: &Logger,
    ) -> Result<bool, RollError> {
        let mut rc = observed.rc.clone();
        rc.replicas_desired = (rc.replicas_desired + delta).max(0);
        match self.rcs.cas(&rc, observed.modify_index).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_conflict() => {
                info!(
                    log,
                    "lost a CAS race; recomputing";
                    "rc" => rc.id.to_string(),
                );
                Ok(false)
            }
            Err(err) if err.is_transient() => {
                warn!(
                    log,
                    "transient failure shifting replicas";
                    "rc" => rc.id.to_string(),
                    "error" => InlineErrorChain::new(&err),
                );
                self.wait(quit).await;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn wait(&self, quit: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = quit.changed() => {}
            _ = tokio::time::sleep(self.config.health_poll_interval) => {}
        }
    }

    async fn unlock(&self, id: &stevedore_common::rc::RcId, log: &Logger) {
        if let Err(err) = self.rcs.unlock(id, self.session.id()).await {
            warn!(
                log,
                "failed to release RC lock";
                "rc" => id.to_string(),
                "error" => InlineErrorChain::new(&err),
            );
        }
    }
}

pub(crate) struct RollStep {
    pub grow: i64,
    pub shrink: i64,
}

/// How many replicas may move this round.
///
/// `headroom` is how many replicas the fleet can afford to have in
/// flight (`healthy + old_desired - minimum`). While the new RC is
/// below target, growth and shrink move in lockstep; once the new RC
/// is at target, any remaining old replicas drain as headroom allows.
pub(crate) fn roll_step(
    headroom: i64,
    target: i64,
    new_desired: i64,
    old_desired: i64,
) -> RollStep {
    if headroom <= 0 {
        return RollStep { grow: 0, shrink: 0 };
    }
    let grow = headroom.min(target - new_desired).max(0);
    let shrink = if grow > 0 {
        grow.min(old_desired)
    } else {
        headroom.min(old_desired)
    };
    RollStep { grow, shrink: shrink.max(0) }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use stevedore_common::health::{HealthResult, HealthState};
    use stevedore_common::logging::test_logger;
    use stevedore_common::manifest::ManifestBuilder;
    use stevedore_common::rc::{RcId, ReplicationController};

    #[test]
    fn test_roll_step_math() {
        // No headroom, no movement.
        let step = roll_step(0, 3, 0, 3);
        assert_eq!((step.grow, step.shrink), (0, 0));
        let step = roll_step(-2, 3, 0, 3);
        assert_eq!((step.grow, step.shrink), (0, 0));

        // Plenty of headroom: move everything at once.
        let step = roll_step(4, 3, 0, 3);
        assert_eq!((step.grow, step.shrink), (3, 3));

        // Tight headroom: one at a time.
        let step = roll_step(1, 3, 1, 2);
        assert_eq!((step.grow, step.shrink), (1, 1));

        // New RC at target; drain the remaining old replicas.
        let step = roll_step(2, 3, 3, 2);
        assert_eq!((step.grow, step.shrink), (0, 2));

        // Nothing left anywhere.
        let step = roll_step(5, 3, 3, 0);
        assert_eq!((step.grow, step.shrink), (0, 0));
    }

    struct FakeRcStore {
        rcs: Mutex<BTreeMap<RcId, VersionedRc>>,
        locks: Mutex<BTreeMap<RcId, String>>,
        /// Every (rc, replicas) state as written, in order.
        history: Mutex<Vec<(RcId, i64)>>,
    }

    impl FakeRcStore {
        fn new(rcs: Vec<ReplicationController>) -> FakeRcStore {
            FakeRcStore {
                rcs: Mutex::new(
                    rcs.into_iter()
                        .map(|rc| {
                            (
                                rc.id.clone(),
                                VersionedRc { rc, modify_index: 1 },
                            )
                        })
                        .collect(),
                ),
                locks: Mutex::new(BTreeMap::new()),
                history: Mutex::new(Vec::new()),
            }
        }

        fn replicas(&self, id: &RcId) -> i64 {
            self.rcs
                .lock()
                .unwrap()
                .get(id)
                .map(|versioned| versioned.rc.replicas_desired)
                .unwrap_or(0)
        }

        fn history(&self) -> Vec<(RcId, i64)> {
            self.history.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RcStore for FakeRcStore {
        async fn get(&self, id: &RcId) -> Result<VersionedRc, RcStoreError> {
            let rcs = self.rcs.lock().unwrap();
            let versioned = rcs
                .get(id)
                .ok_or_else(|| KvError::NotFound { key: id.to_string() })?;
            Ok(VersionedRc {
                rc: versioned.rc.clone(),
                modify_index: versioned.modify_index,
            })
        }

        async fn cas(
            &self,
            rc: &ReplicationController,
            expected_index: u64,
        ) -> Result<(), RcStoreError> {
            let mut rcs = self.rcs.lock().unwrap();
            let versioned = rcs
                .get_mut(&rc.id)
                .ok_or_else(|| KvError::NotFound { key: rc.id.to_string() })?;
            if versioned.modify_index != expected_index {
                return Err(
                    KvError::Conflict { key: rc.id.to_string() }.into()
                );
            }
            versioned.rc = rc.clone();
            versioned.modify_index += 1;
            self.history
                .lock()
                .unwrap()
                .push((rc.id.clone(), rc.replicas_desired));
            Ok(())
        }

        async fn lock(
            &self,
            id: &RcId,
            session: &str,
        ) -> Result<bool, RcStoreError> {
            let mut locks = self.locks.lock().unwrap();
            match locks.get(id) {
                Some(holder) => Ok(holder == session),
                None => {
                    locks.insert(id.clone(), session.to_string());
                    Ok(true)
                }
            }
        }

        async fn unlock(
            &self,
            id: &RcId,
            session: &str,
        ) -> Result<(), RcStoreError> {
            let mut locks = self.locks.lock().unwrap();
            if locks.get(id).map(String::as_str) == Some(session) {
                locks.remove(id);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRollStore {
        updates: Mutex<BTreeMap<RcId, Update>>,
    }

    #[async_trait]
    impl RollStore for FakeRollStore {
        async fn get(
            &self,
            id: &RcId,
        ) -> Result<Option<Update>, RollStoreError> {
            Ok(self.updates.lock().unwrap().get(id).cloned())
        }

        async fn put(&self, update: &Update) -> Result<(), RollStoreError> {
            let mut updates = self.updates.lock().unwrap();
            if updates.contains_key(&update.new_rc) {
                return Err(RollStoreError::AlreadyExists {
                    id: update.new_rc.clone(),
                });
            }
            updates.insert(update.new_rc.clone(), update.clone());
            Ok(())
        }

        async fn delete(&self, id: &RcId) -> Result<(), RollStoreError> {
            self.updates.lock().unwrap().remove(id);
            Ok(())
        }
    }

    /// Health that tracks the new RC: every desired new replica is
    /// instantly Passing, plus a fixed set of base nodes.
    struct TrackingHealth {
        rcs: Arc<FakeRcStore>,
        tracked: RcId,
        base_passing: usize,
    }

    #[async_trait]
    impl HealthChecker for TrackingHealth {
        async fn service_health(
            &self,
            pod: &str,
        ) -> Result<BTreeMap<String, HealthResult>, KvError> {
            let passing = self.base_passing
                + self.rcs.replicas(&self.tracked).max(0) as usize;
            Ok((0..passing)
                .map(|i| {
                    let node = format!("n{i}");
                    (
                        node.clone(),
                        HealthResult {
                            pod: pod.to_string(),
                            node,
                            status: HealthState::Passing,
                            output: String::new(),
                            modified_at: Utc::now(),
                        },
                    )
                })
                .collect())
        }
    }

    fn rc(id: &str, replicas: i64) -> ReplicationController {
        ReplicationController {
            id: RcId::new(id),
            manifest: ManifestBuilder::new("web").build(),
            node_selector: String::new(),
            replicas_desired: replicas,
        }
    }

    fn update(old: &str, new: &str, desired: i64, minimum: i64) -> Update {
        Update {
            old_rc: RcId::new(old),
            new_rc: RcId::new(new),
            desired_replicas: desired,
            minimum_replicas: minimum,
        }
    }

    fn controller(
        rcs: Arc<FakeRcStore>,
        rolls: Arc<FakeRollStore>,
        health: Arc<TrackingHealth>,
        session: &str,
    ) -> RollController<FakeRcStore, FakeRollStore, TrackingHealth> {
        RollController::new(
            rcs,
            rolls,
            health,
            SessionHandle::for_tests(session),
            RollConfig {
                stall_timeout: Duration::from_millis(200),
                health_poll_interval: Duration::from_millis(10),
            },
            &test_logger("roll"),
        )
    }

    fn quit_never() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_happy_path_honors_minimum() {
        let rcs = Arc::new(FakeRcStore::new(vec![
            rc("rc-old", 3),
            rc("rc-new", 0),
        ]));
        let rolls = Arc::new(FakeRollStore::default());
        let u = update("rc-old", "rc-new", 3, 2);
        rolls.put(&u).await.unwrap();

        // No base health: only the new RC's replicas count, so the
        // roll must go one replica at a time.
        let health = Arc::new(TrackingHealth {
            rcs: rcs.clone(),
            tracked: RcId::new("rc-new"),
            base_passing: 0,
        });

        let controller =
            controller(rcs.clone(), rolls.clone(), health, "sess-1");
        let outcome = controller.run(&u, quit_never()).await.unwrap();
        assert_eq!(outcome, RollOutcome::Completed);

        assert_eq!(rcs.replicas(&RcId::new("rc-new")), 3);
        assert_eq!(rcs.replicas(&RcId::new("rc-old")), 0);
        assert!(rolls.get(&RcId::new("rc-new")).await.unwrap().is_none());

        // Replay the CAS history and check the health floor at every
        // observed state: old + healthyNew >= minimum throughout.
        let mut old_desired = 3i64;
        let mut new_desired = 0i64;
        for (id, replicas) in rcs.history() {
            if id == RcId::new("rc-new") {
                new_desired = replicas;
            } else {
                old_desired = replicas;
            }
            assert!(
                old_desired + new_desired >= u.minimum_replicas,
                "floor violated at old={old_desired} new={new_desired}"
            );
        }
        // Locks released.
        assert!(rcs.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_contention_aborts_without_mutation() {
        let rcs = Arc::new(FakeRcStore::new(vec![
            rc("rc-old", 3),
            rc("rc-new", 0),
        ]));
        let rolls = Arc::new(FakeRollStore::default());
        let u = update("rc-old", "rc-new", 3, 2);
        rolls.put(&u).await.unwrap();

        // Another roller already holds the old RC's lock.
        rcs.lock(&RcId::new("rc-old"), "other-session").await.unwrap();

        let health = Arc::new(TrackingHealth {
            rcs: rcs.clone(),
            tracked: RcId::new("rc-new"),
            base_passing: 3,
        });
        let controller =
            controller(rcs.clone(), rolls.clone(), health, "sess-2");
        let outcome = controller.run(&u, quit_never()).await.unwrap();

        assert_eq!(outcome, RollOutcome::AlreadyOwned);
        assert!(rcs.history().is_empty());
        assert_eq!(rcs.replicas(&RcId::new("rc-new")), 0);
        assert_eq!(rcs.replicas(&RcId::new("rc-old")), 3);
        // The update record is untouched.
        assert!(rolls.get(&RcId::new("rc-new")).await.unwrap().is_some());
        // Our own tentative lock on the new RC was released; the other
        // session's lock remains.
        let locks = rcs.locks.lock().unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[&RcId::new("rc-old")], "other-session");
    }

    #[tokio::test]
    async fn test_no_headroom_stalls() {
        // One old replica, minimum of two, and nothing healthy: no
        // movement is ever safe.
        let rcs = Arc::new(FakeRcStore::new(vec![
            rc("rc-old", 1),
            rc("rc-new", 0),
        ]));
        let rolls = Arc::new(FakeRollStore::default());
        let u = update("rc-old", "rc-new", 1, 2);
        rolls.put(&u).await.unwrap();

        let health = Arc::new(TrackingHealth {
            rcs: rcs.clone(),
            tracked: RcId::new("rc-missing"),
            base_passing: 0,
        });
        let controller =
            controller(rcs.clone(), rolls.clone(), health, "sess-3");
        let outcome = controller.run(&u, quit_never()).await.unwrap();

        assert_eq!(outcome, RollOutcome::Stalled);
        assert!(rcs.history().is_empty());
        // Stalled updates stay queued for retry.
        assert!(rolls.get(&RcId::new("rc-new")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_already_complete_update_is_consumed() {
        let rcs = Arc::new(FakeRcStore::new(vec![
            rc("rc-old", 0),
            rc("rc-new", 3),
        ]));
        let rolls = Arc::new(FakeRollStore::default());
        let u = update("rc-old", "rc-new", 3, 2);
        rolls.put(&u).await.unwrap();

        let health = Arc::new(TrackingHealth {
            rcs: rcs.clone(),
            tracked: RcId::new("rc-new"),
            base_passing: 0,
        });
        let controller =
            controller(rcs.clone(), rolls.clone(), health, "sess-4");
        let outcome = controller.run(&u, quit_never()).await.unwrap();

        assert_eq!(outcome, RollOutcome::Completed);
        assert!(rcs.history().is_empty());
        assert!(rolls.get(&RcId::new("rc-new")).await.unwrap().is_none());
    }
}
