// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The KV layer: a Consul-shaped client, sessions, long-poll watches,
//! and the typed stores built on top of them.
//!
//! Layering runs bottom-up: [`client::KvClient`] exposes the primitive
//! operations (get / CAS / delete / acquire / list-with-wait-index);
//! [`session`] ties ephemeral ownership to a renewal task; [`watch`]
//! turns the blocking list into a stream of full snapshots; and the
//! `*_store` modules translate between wire bytes and the shared data
//! model for each KV subtree.

pub mod client;
pub mod error;
pub mod health;
pub mod paths;
pub mod pod_store;
pub mod rc_store;
pub mod roll_store;
pub mod session;
pub mod watch;

pub use client::{KvClient, KvConfig, KvPair};
pub use error::KvError;
pub use session::SessionHandle;
