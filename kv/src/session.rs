// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! KV sessions: ephemeral identities that tie lock and health-entry
//! ownership to a live renewal task.
//!
//! Every long-lived mutator owns one session. The keeper renews it at
//! half the TTL; if renewal discovers the session is gone, everything it
//! held has been released server-side and the loss is announced so the
//! owner can unwind. This is the system's primary liveness mechanism.

use std::time::Duration;

use serde::Deserialize;
use slog::{Logger, info, o, warn};
use slog_error_chain::InlineErrorChain;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::client::KvClient;
use crate::error::KvError;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Human-readable owner name, visible in the KV server's session
    /// listing.
    pub name: String,
    pub ttl: Duration,
    pub lock_delay: Duration,
}

impl SessionConfig {
    pub fn new(name: &str) -> SessionConfig {
        SessionConfig {
            name: name.to_string(),
            ttl: DEFAULT_SESSION_TTL,
            lock_delay: DEFAULT_LOCK_DELAY,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionCreateResponse {
    #[serde(rename = "ID")]
    id: String,
}

impl KvClient {
    pub async fn session_create(
        &self,
        config: &SessionConfig,
    ) -> Result<String, KvError> {
        let body = serde_json::json!({
            "Name": config.name,
            "TTL": format!("{}s", config.ttl.as_secs()),
            "LockDelay": format!("{}s", config.lock_delay.as_secs()),
            // Entries acquired under the session vanish with it; this
            // is what makes health entries self-expiring.
            "Behavior": "delete",
        });
        let url = self.session_url("create");
        let resp = self
            .request(reqwest::Method::PUT, url)
            .json(&body)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "session-create",
                key: "session".to_string(),
                err,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(KvError::UnexpectedStatus {
                verb: "session-create",
                key: "session".to_string(),
                status: status.as_u16(),
            });
        }
        let created: SessionCreateResponse =
            resp.json().await.map_err(|err| KvError::Transport {
                verb: "session-create",
                key: "session".to_string(),
                err,
            })?;
        Ok(created.id)
    }

    pub async fn session_renew(&self, id: &str) -> Result<(), KvError> {
        let url = self.session_url(&format!("renew/{id}"));
        let resp = self
            .request(reqwest::Method::PUT, url)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "session-renew",
                key: id.to_string(),
                err,
            })?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(KvError::SessionExpired { session: id.to_string() });
        }
        if status.is_server_error() {
            return Err(KvError::ServerError {
                verb: "session-renew",
                key: id.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(KvError::UnexpectedStatus {
                verb: "session-renew",
                key: id.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    pub async fn session_destroy(&self, id: &str) -> Result<(), KvError> {
        let url = self.session_url(&format!("destroy/{id}"));
        let resp = self
            .request(reqwest::Method::PUT, url)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "session-destroy",
                key: id.to_string(),
                err,
            })?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(KvError::ServerError {
                verb: "session-destroy",
                key: id.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    fn session_url(&self, op: &str) -> String {
        format!("{}/v1/session/{}", self.base_url(), op)
    }
}

/// A live session plus the signal announcing its death.
///
/// Clones share the underlying session; dropping handles does not
/// destroy it (the keeper task owns that on quit).
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: String,
    lost: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// A receiver that flips to true exactly once, when the session can
    /// no longer be renewed (or the keeper has shut down).
    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }

    /// Construct a handle for tests that never expires.
    pub fn for_tests(id: &str) -> SessionHandle {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the signal stays quiet for the life of the
        // test.
        std::mem::forget(tx);
        SessionHandle { id: id.to_string(), lost: rx }
    }
}

/// Create a session and spawn the renewal task for it.
///
/// The task renews at TTL/2, tolerates transient failures (the TTL
/// gives it several tries), announces loss when the server says the
/// session is gone, and destroys the session on quit.
pub async fn start_session(
    client: &KvClient,
    config: SessionConfig,
    mut quit: watch::Receiver<bool>,
    log: &Logger,
) -> Result<SessionHandle, KvError> {
    let id = client.session_create(&config).await?;
    let log = log.new(o!("component" => "SessionKeeper", "session" => id.clone()));
    info!(log, "session established"; "name" => &config.name);

    let (lost_tx, lost_rx) = watch::channel(false);
    let keeper_client = client.clone();
    let keeper_id = id.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.ttl / 2);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; renewing a fresh
        // session is harmless.
        loop {
            tokio::select! {
                _ = quit.changed() => {
                    if let Err(err) =
                        keeper_client.session_destroy(&keeper_id).await
                    {
                        warn!(
                            log,
                            "failed to destroy session on shutdown";
                            "error" => InlineErrorChain::new(&err),
                        );
                    }
                    let _ = lost_tx.send(true);
                    return;
                }
                _ = interval.tick() => {
                    match keeper_client.session_renew(&keeper_id).await {
                        Ok(()) => {}
                        Err(err) if err.is_transient() => {
                            warn!(
                                log,
                                "transient failure renewing session";
                                "error" => InlineErrorChain::new(&err),
                            );
                        }
                        Err(err) => {
                            warn!(
                                log,
                                "session lost";
                                "error" => InlineErrorChain::new(&err),
                            );
                            let _ = lost_tx.send(true);
                            return;
                        }
                    }
                }
            }
        }
    });

    Ok(SessionHandle { id, lost: lost_rx })
}
