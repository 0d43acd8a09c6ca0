//! Routing tree.
//!
//! [`RouteTree`] flattens a [`RouteConfig`] into an arena of nodes with
//! every inheritable option resolved. Matching is depth first: a node
//! matches if its matchers do, its children are tried in order and the
//! first matching child stops the scan unless it has `continue` set. A node
//! none of whose children match is itself the result.

use std::time::Duration;

use vigil_alerts::{Labels, Matchers};

use crate::config::{
    DEFAULT_GROUP_INTERVAL, DEFAULT_GROUP_WAIT, DEFAULT_REPEAT_INTERVAL, GROUP_BY_ALL, RouteConfig,
};
use crate::error::{NotifyError, Result};

/// How a route groups alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBy {
    /// Every label; each alert is its own group.
    All,
    /// The listed labels.
    Labels(Vec<String>),
}

impl GroupBy {
    fn from_config(labels: &[String]) -> Self {
        if labels.iter().any(|l| l == GROUP_BY_ALL) {
            Self::All
        } else {
            Self::Labels(labels.to_vec())
        }
    }

    /// The grouping labels of an alert.
    #[must_use]
    pub fn group_labels(&self, labels: &Labels) -> Labels {
        match self {
            Self::All => labels.clone(),
            Self::Labels(names) => labels.project(names.iter().map(String::as_str)),
        }
    }
}

/// A resolved routing node.
#[derive(Debug, Clone)]
pub struct RouteNode {
    /// Index in the arena.
    pub id: usize,
    /// Stable key derived from the node's position and matchers.
    pub key: String,
    /// Receiver, inherited if unset.
    pub receiver: String,
    /// Grouping, inherited if unset.
    pub group_by: GroupBy,
    /// Initial wait, inherited if unset.
    pub group_wait: Duration,
    /// Interval between updates, inherited if unset.
    pub group_interval: Duration,
    /// Repeat interval, inherited if unset.
    pub repeat_interval: Duration,
    /// Own matchers.
    pub matchers: Matchers,
    /// Keep matching siblings.
    pub continue_matching: bool,
    /// Mute timings; not inherited.
    pub mute_time_intervals: Vec<String>,
    children: Vec<usize>,
}

/// A compiled routing tree.
#[derive(Debug, Clone)]
pub struct RouteTree {
    nodes: Vec<RouteNode>,
}

impl RouteTree {
    /// Builds the tree from its configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidConfig` if the root has no receiver.
    pub fn new(root: &RouteConfig) -> Result<Self> {
        let receiver = root
            .receiver
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| NotifyError::invalid_config("root route must specify a default receiver"))?;
        let defaults = RouteNode {
            id: 0,
            key: String::new(),
            receiver,
            group_by: GroupBy::Labels(Vec::new()),
            group_wait: DEFAULT_GROUP_WAIT,
            group_interval: DEFAULT_GROUP_INTERVAL,
            repeat_interval: DEFAULT_REPEAT_INTERVAL,
            matchers: Matchers::new(),
            continue_matching: false,
            mute_time_intervals: Vec::new(),
            children: Vec::new(),
        };
        let mut tree = Self { nodes: Vec::new() };
        tree.add(root, &defaults, "{}".to_string());
        Ok(tree)
    }

    fn add(&mut self, config: &RouteConfig, parent: &RouteNode, key: String) -> usize {
        let id = self.nodes.len();
        let node = RouteNode {
            id,
            key,
            receiver: config
                .receiver
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| parent.receiver.clone()),
            group_by: config
                .group_by
                .as_deref()
                .map_or_else(|| parent.group_by.clone(), GroupBy::from_config),
            group_wait: config.group_wait.unwrap_or(parent.group_wait),
            group_interval: config.group_interval.unwrap_or(parent.group_interval),
            repeat_interval: config.repeat_interval.unwrap_or(parent.repeat_interval),
            matchers: config.matchers.clone(),
            continue_matching: config.continue_matching,
            mute_time_intervals: config.mute_time_intervals.clone(),
            children: Vec::new(),
        };
        self.nodes.push(node);

        let parent_key = self.nodes[id].key.clone();
        let resolved = self.nodes[id].clone();
        for (index, child) in config.routes.iter().enumerate() {
            let matchers: Vec<String> = child.matchers.iter().map(ToString::to_string).collect();
            let child_key = format!("{parent_key}/{index}{{{}}}", matchers.join(","));
            let child_id = self.add(child, &resolved, child_key);
            self.nodes[id].children.push(child_id);
        }
        id
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> &RouteNode {
        &self.nodes[0]
    }

    /// Node by arena index.
    #[must_use]
    pub fn node(&self, id: usize) -> Option<&RouteNode> {
        self.nodes.get(id)
    }

    /// Every node, root first.
    pub fn nodes(&self) -> impl Iterator<Item = &RouteNode> {
        self.nodes.iter()
    }

    /// Routes an alert. Never empty: the root matches everything.
    #[must_use]
    pub fn route(&self, labels: &Labels) -> Vec<&RouteNode> {
        let mut out = Vec::new();
        self.match_node(0, labels, &mut out);
        if out.is_empty() {
            out.push(0);
        }
        out.into_iter().map(|id| &self.nodes[id]).collect()
    }

    fn match_node(&self, id: usize, labels: &Labels, out: &mut Vec<usize>) -> bool {
        let node = &self.nodes[id];
        if id != 0 && !node.matchers.matches(labels) {
            return false;
        }
        let mut child_matched = false;
        for &child in &node.children {
            if self.match_node(child, labels, out) {
                child_matched = true;
                if !self.nodes[child].continue_matching {
                    break;
                }
            }
        }
        if !child_matched {
            out.push(id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(value: serde_json::Value) -> RouteTree {
        let config: RouteConfig = serde_json::from_value(value).unwrap();
        RouteTree::new(&config).unwrap()
    }

    fn receivers(tree: &RouteTree, labels: &Labels) -> Vec<String> {
        tree.route(labels).iter().map(|n| n.receiver.clone()).collect()
    }

    fn sample() -> RouteTree {
        tree(json!({
            "receiver": "default",
            "group_by": ["alertname"],
            "group_wait": "30s",
            "routes": [
                {
                    "receiver": "db",
                    "object_matchers": [{"name": "team", "value": "db"}],
                    "group_wait": "5s",
                    "routes": [
                        {"receiver": "db-critical",
                         "object_matchers": [{"name": "severity", "value": "critical"}]}
                    ]
                },
                {
                    "receiver": "audit",
                    "object_matchers": [{"name": "team", "value": "db"}],
                    "continue": true
                },
                {
                    "receiver": "web",
                    "object_matchers": [{"name": "team", "value": "web"}],
                    "group_by": ["..."]
                }
            ]
        }))
    }

    #[test]
    fn unmatched_alerts_go_to_root() {
        let t = sample();
        assert_eq!(receivers(&t, &Labels::new().with("team", "ops")), vec!["default"]);
    }

    #[test]
    fn first_match_wins_without_continue() {
        let t = sample();
        assert_eq!(receivers(&t, &Labels::new().with("team", "db")), vec!["db"]);
    }

    #[test]
    fn deepest_matching_child_is_used() {
        let t = sample();
        let labels = Labels::new().with("team", "db").with("severity", "critical");
        let matched = t.route(&labels);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].receiver, "db-critical");
        // Inherited from the "db" parent.
        assert_eq!(matched[0].group_wait, Duration::from_secs(5));
        assert_eq!(matched[0].group_by, GroupBy::Labels(vec!["alertname".to_string()]));
    }

    #[test]
    fn continue_keeps_matching_siblings() {
        let t = tree(json!({
            "receiver": "default",
            "routes": [
                {"receiver": "a", "object_matchers": [{"name": "x", "value": "1"}], "continue": true},
                {"receiver": "b", "object_matchers": [{"name": "x", "value": "1"}]},
                {"receiver": "c", "object_matchers": [{"name": "x", "value": "1"}]}
            ]
        }));
        assert_eq!(receivers(&t, &Labels::new().with("x", "1")), vec!["a", "b"]);
    }

    #[test]
    fn wildcard_group_by_uses_all_labels() {
        let t = sample();
        let labels = Labels::new().with("team", "web").with("pod", "p1");
        let node = t.route(&labels)[0];
        assert_eq!(node.group_by, GroupBy::All);
        assert_eq!(node.group_by.group_labels(&labels), labels);
    }

    #[test]
    fn defaults_apply_to_root() {
        let t = tree(json!({"receiver": "r"}));
        assert_eq!(t.root().group_interval, DEFAULT_GROUP_INTERVAL);
        assert_eq!(t.root().repeat_interval, DEFAULT_REPEAT_INTERVAL);
    }

    #[test]
    fn keys_are_unique_per_node() {
        let t = sample();
        let mut keys: Vec<_> = t.nodes().map(|n| n.key.clone()).collect();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), total);
    }
}
