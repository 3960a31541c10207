// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! KV error taxonomy.
//!
//! The distinction that matters to every caller is transient vs. not:
//! transport failures and server errors are retried with backoff and
//! never treated as fatal, while conflicts and missing keys are
//! caller-visible outcomes.

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("KV {verb} {key:?} failed in transport")]
    Transport {
        verb: &'static str,
        key: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("KV {verb} {key:?} returned server error {status}")]
    ServerError { verb: &'static str, key: String, status: u16 },

    #[error("KV {verb} {key:?} returned unexpected status {status}")]
    UnexpectedStatus { verb: &'static str, key: String, status: u16 },

    #[error("KV {verb} {key:?} returned an unexpected response: {detail}")]
    UnexpectedResponse { verb: &'static str, key: String, detail: String },

    #[error("key {key:?} not found")]
    NotFound { key: String },

    #[error("compare-and-swap on {key:?} lost the race")]
    Conflict { key: String },

    #[error("session {session:?} has expired")]
    SessionExpired { session: String },
}

impl KvError {
    /// Whether retrying the same operation can reasonably be expected
    /// to succeed once the KV store recovers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KvError::Transport { .. } | KvError::ServerError { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, KvError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound { .. })
    }
}
