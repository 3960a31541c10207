// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pod lifecycle engine.
//!
//! A [`pod::Pod`] is the installed presence of one manifest id on one
//! node, rooted at `<pod_root>/<podId>`. The engine drives the four
//! lifecycle transitions (install, launch, halt, uninstall) plus
//! verification, delegating per-artifact work to [`launchable`]
//! implementations and service supervision to the runit-shaped
//! [`supervisor`] integration.

pub mod digest;
pub mod execution;
pub mod fetch;
pub mod hoist;
pub mod hooks;
pub mod launchable;
pub mod opencontainer;
pub mod pod;
pub mod supervisor;
pub mod users;

pub use launchable::LaunchableFlags;
pub use pod::{Pod, PodDeps};
