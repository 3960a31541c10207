// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model and utilities shared by every stevedore component.
//!
//! Nothing in this crate talks to the network or the filesystem beyond
//! reading manifest files; it exists so the KV layer, the pod lifecycle
//! engine, and the controllers agree on wire formats and retry behavior.

pub mod backoff;
pub mod health;
pub mod logging;
pub mod manifest;
pub mod rc;
