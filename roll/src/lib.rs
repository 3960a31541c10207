// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolling updates: move replicas from an old RC to a new one without
//! dropping below a health floor.
//!
//! [`controller`] executes a single update; [`farm`] watches the roll
//! tree and runs one controller per live update under a shared
//! session. Everything is restart-safe: each step derives its action
//! from observed RC state, so a controller that dies mid-roll is
//! resumed by whichever farm next wins the locks.

pub mod config;
pub mod controller;
pub mod farm;

pub use controller::{RollConfig, RollController, RollOutcome};
pub use farm::Farm;
