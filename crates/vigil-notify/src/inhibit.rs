//! Inhibition rules.
//!
//! A firing alert matching an inhibit rule's source matchers suppresses every
//! other alert matching its target matchers, provided both carry the same
//! values for the rule's `equal` labels. A label missing on both sides counts
//! as equal.

use vigil_alerts::{Fingerprint, Labels};

use crate::config::InhibitRule;

/// Evaluates inhibit rules against a set of firing alerts.
#[derive(Debug, Clone, Default)]
pub struct Inhibitor {
    rules: Vec<InhibitRule>,
}

impl Inhibitor {
    /// Creates an inhibitor for the given rules.
    #[must_use]
    pub const fn new(rules: Vec<InhibitRule>) -> Self {
        Self { rules }
    }

    /// True if no rules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Fingerprints of the firing alerts that inhibit `labels`.
    ///
    /// An alert never inhibits itself.
    #[must_use]
    pub fn inhibited_by(&self, labels: &Labels, firing: &[Labels]) -> Vec<Fingerprint> {
        let own = labels.fingerprint();
        let mut out = Vec::new();
        for rule in &self.rules {
            if !rule.target_matchers.matches(labels) {
                continue;
            }
            for source in firing {
                let fp = source.fingerprint();
                if fp == own || out.contains(&fp) {
                    continue;
                }
                if rule.source_matchers.matches(source)
                    && rule.equal.iter().all(|name| source.get(name) == labels.get(name))
                {
                    out.push(fp);
                }
            }
        }
        out
    }

    /// True if some firing alert inhibits `labels`.
    #[must_use]
    pub fn is_inhibited(&self, labels: &Labels, firing: &[Labels]) -> bool {
        !self.inhibited_by(labels, firing).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_alerts::Matchers;

    fn rule(equal: &[&str]) -> InhibitRule {
        InhibitRule {
            source_matchers: Matchers::parse(&["severity=critical"]).unwrap(),
            target_matchers: Matchers::parse(&["severity=warning"]).unwrap(),
            equal: equal.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn critical_inhibits_warning_on_same_cluster() {
        let inhibitor = Inhibitor::new(vec![rule(&["cluster"])]);
        let critical = Labels::new().with("severity", "critical").with("cluster", "eu");
        let warning = Labels::new().with("severity", "warning").with("cluster", "eu");
        assert!(inhibitor.is_inhibited(&warning, &[critical.clone()]));
        assert_eq!(
            inhibitor.inhibited_by(&warning, &[critical.clone()]),
            vec![critical.fingerprint()]
        );
    }

    #[test]
    fn different_equal_label_does_not_inhibit() {
        let inhibitor = Inhibitor::new(vec![rule(&["cluster"])]);
        let critical = Labels::new().with("severity", "critical").with("cluster", "us");
        let warning = Labels::new().with("severity", "warning").with("cluster", "eu");
        assert!(!inhibitor.is_inhibited(&warning, &[critical]));
    }

    #[test]
    fn label_missing_on_both_counts_as_equal() {
        let inhibitor = Inhibitor::new(vec![rule(&["cluster"])]);
        let critical = Labels::new().with("severity", "critical");
        let warning = Labels::new().with("severity", "warning");
        assert!(inhibitor.is_inhibited(&warning, &[critical]));
    }

    #[test]
    fn alert_matching_both_sides_does_not_inhibit_itself() {
        let inhibitor = Inhibitor::new(vec![InhibitRule {
            source_matchers: Matchers::parse(&["team=db"]).unwrap(),
            target_matchers: Matchers::parse(&["team=db"]).unwrap(),
            equal: Vec::new(),
        }]);
        let alert = Labels::new().with("team", "db");
        assert!(!inhibitor.is_inhibited(&alert, &[alert.clone()]));
    }

    #[test]
    fn no_rules_never_inhibit() {
        let inhibitor = Inhibitor::default();
        assert!(inhibitor.is_empty());
        let l = Labels::new().with("severity", "warning");
        assert!(!inhibitor.is_inhibited(&l, &[Labels::new().with("severity", "critical")]));
    }
}
