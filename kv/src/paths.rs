// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key construction for every KV subtree this system touches.

use stevedore_common::rc::RcId;

pub const INTENT_TREE: &str = "intent";
pub const REALITY_TREE: &str = "reality";
pub const HEALTH_TREE: &str = "health";
pub const RC_TREE: &str = "rcs";
pub const ROLL_TREE: &str = "rolls";
pub const LOCK_TREE: &str = "locks";

/// Prefix holding every pod manifest for one node in one tree.
pub fn node_prefix(tree: &str, node: &str) -> String {
    format!("{tree}/{node}")
}

/// Key of one pod's manifest for one node in one tree.
pub fn pod_path(tree: &str, node: &str, pod: &str) -> String {
    format!("{tree}/{node}/{pod}")
}

/// Key of one node's latest health verdict for one pod.
pub fn health_path(pod: &str, node: &str) -> String {
    format!("{HEALTH_TREE}/{pod}/{node}")
}

/// Prefix holding every node's health verdict for one pod.
pub fn health_prefix(pod: &str) -> String {
    format!("{HEALTH_TREE}/{pod}")
}

pub fn rc_path(id: &RcId) -> String {
    format!("{RC_TREE}/{id}")
}

/// Updates are keyed by their new RC's id.
pub fn roll_path(id: &RcId) -> String {
    format!("{ROLL_TREE}/{id}")
}

/// Lock keys mirror the path they protect.
pub fn lock_path(subpath: &str) -> String {
    format!("{LOCK_TREE}/{subpath}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_path_layout() {
        assert_eq!(pod_path(INTENT_TREE, "n1", "web"), "intent/n1/web");
        assert_eq!(pod_path(REALITY_TREE, "n1", "web"), "reality/n1/web");
        assert_eq!(health_path("web", "n1"), "health/web/n1");
        assert_eq!(rc_path(&RcId::new("rc-1")), "rcs/rc-1");
        assert_eq!(roll_path(&RcId::new("rc-1")), "rolls/rc-1");
        assert_eq!(
            lock_path(&rc_path(&RcId::new("rc-1"))),
            "locks/rcs/rc-1"
        );
    }
}
