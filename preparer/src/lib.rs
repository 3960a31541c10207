// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The preparer: the per-node orchestrator.
//!
//! One preparer runs on every node. It watches the node's intent tree,
//! hands each pod id to a dedicated worker task that serializes
//! lifecycle transitions for that pod, publishes what it actually
//! installed to the reality tree, and runs the health watcher that
//! scores the node's pods for the rest of the fleet.

pub mod config;
pub mod health;
pub mod preparer;
pub mod worker;

pub use config::PreparerConfig;
pub use preparer::Preparer;
