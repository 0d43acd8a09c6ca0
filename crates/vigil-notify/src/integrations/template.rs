//! Data passed to notification templates, and the default texts.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use vigil_alerts::Labels;

use super::NotifyContext;
use crate::pipeline::{AlertStatus, Notification};

/// One alert as seen by templates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateAlert {
    /// `firing` or `resolved`.
    pub status: AlertStatus,
    /// Labels without internal ones.
    pub labels: Labels,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Start of the episode.
    pub starts_at: DateTime<Utc>,
    /// End, or the expected end while firing.
    pub ends_at: DateTime<Utc>,
    /// Rule link.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    /// Label fingerprint.
    pub fingerprint: String,
}

/// Everything a notification template can reference.
///
/// ```text
/// {{ status }} {{ commonLabels.alertname }}: {{ numFiring }} firing
/// {{#each alerts}}{{ labels.instance }} {{/each}}
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateData {
    /// Receiver name.
    pub receiver: String,
    /// Overall status.
    pub status: AlertStatus,
    /// All alerts.
    pub alerts: Vec<TemplateAlert>,
    /// Grouping labels.
    pub group_labels: Labels,
    /// Labels shared by every alert.
    pub common_labels: Labels,
    /// Annotations shared by every alert.
    pub common_annotations: BTreeMap<String, String>,
    /// Public URL.
    #[serde(rename = "externalURL")]
    pub external_url: String,
    /// Aggregation group key.
    pub group_key: String,
    /// Number of firing alerts.
    pub num_firing: usize,
    /// Number of resolved alerts.
    pub num_resolved: usize,
}

impl TemplateData {
    /// Builds the data for a notification.
    #[must_use]
    pub fn new(notification: &Notification, external_url: &str) -> Self {
        let alerts: Vec<TemplateAlert> = notification
            .alerts
            .iter()
            .map(|a| TemplateAlert {
                status: notification.alert_status(a),
                labels: a.labels.without_internal(),
                annotations: a.annotations.clone(),
                starts_at: a.starts_at,
                ends_at: a.ends_at,
                generator_url: a.generator_url.clone(),
                fingerprint: a.fingerprint().to_string(),
            })
            .collect();
        let (common_labels, common_annotations) = extract_common(&alerts);
        let num_firing = alerts.iter().filter(|a| a.status == AlertStatus::Firing).count();
        Self {
            receiver: notification.receiver.clone(),
            status: notification.status(),
            num_resolved: alerts.len() - num_firing,
            num_firing,
            alerts,
            group_labels: notification.group_labels.without_internal(),
            common_labels,
            common_annotations,
            external_url: external_url.to_string(),
            group_key: notification.group_key.clone(),
        }
    }

    /// `[FIRING:2] HighCPU infra`.
    #[must_use]
    pub fn default_title(&self) -> String {
        let mut title = format!("[{}", self.status.as_str().to_uppercase());
        if self.status == AlertStatus::Firing {
            let _ = write!(title, ":{}", self.num_firing);
        }
        title.push(']');
        for (_, value) in self.group_labels.iter() {
            title.push(' ');
            title.push_str(value);
        }
        title
    }

    /// One block per alert with its labels and annotations.
    #[must_use]
    pub fn default_message(&self) -> String {
        let mut out = String::new();
        for (status, heading) in [
            (AlertStatus::Firing, "Firing"),
            (AlertStatus::Resolved, "Resolved"),
        ] {
            let alerts: Vec<&TemplateAlert> =
                self.alerts.iter().filter(|a| a.status == status).collect();
            if alerts.is_empty() {
                continue;
            }
            let _ = writeln!(out, "**{heading}**");
            for alert in alerts {
                out.push('\n');
                out.push_str("Labels:\n");
                for (k, v) in alert.labels.iter() {
                    let _ = writeln!(out, " - {k} = {v}");
                }
                if !alert.annotations.is_empty() {
                    out.push_str("Annotations:\n");
                    for (k, v) in &alert.annotations {
                        let _ = writeln!(out, " - {k} = {v}");
                    }
                }
                if !alert.generator_url.is_empty() {
                    let _ = writeln!(out, "Source: {}", alert.generator_url);
                }
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

fn extract_common(alerts: &[TemplateAlert]) -> (Labels, BTreeMap<String, String>) {
    let Some(first) = alerts.first() else {
        return (Labels::new(), BTreeMap::new());
    };
    let labels = first
        .labels
        .iter()
        .filter(|(k, v)| alerts.iter().all(|a| a.labels.get(k) == Some(*v)))
        .collect();
    let annotations = first
        .annotations
        .iter()
        .filter(|(k, v)| alerts.iter().all(|a| a.annotations.get(*k) == Some(*v)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (labels, annotations)
}

/// Renders a user template, falling back to `fallback` on empty input or
/// render failure.
pub(crate) fn render_or(
    ctx: &NotifyContext,
    source: Option<&str>,
    data: &TemplateData,
    fallback: impl FnOnce() -> String,
) -> String {
    match source.map(str::trim).filter(|s| !s.is_empty()) {
        None => fallback(),
        Some(source) => match ctx.templates.render(source, data) {
            Ok(out) => out,
            Err(e) => {
                warn!(receiver = %data.receiver, error = %e, "failed to render notification template");
                fallback()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_alerts::{PostableAlert, TemplateEngine};

    fn notification() -> Notification {
        let now = Utc::now();
        let alert = |host: &str, ends_in: i64| PostableAlert {
            labels: Labels::new()
                .with("alertname", "HighCPU")
                .with("host", host)
                .with("__alert_rule_uid__", "r1"),
            annotations: BTreeMap::from([("summary".to_string(), "cpu high".to_string())]),
            starts_at: now - chrono::Duration::minutes(5),
            ends_at: now + chrono::Duration::minutes(ends_in),
            generator_url: "http://vigil.local/alerting/rules/r1".to_string(),
        };
        Notification {
            receiver: "ops".to_string(),
            group_key: "{}:{alertname=\"HighCPU\"}".to_string(),
            group_labels: Labels::new().with("alertname", "HighCPU"),
            alerts: vec![alert("a", 10), alert("b", -1)],
            at: now,
        }
    }

    fn ctx() -> NotifyContext {
        NotifyContext {
            templates: TemplateEngine::new(),
            external_url: "http://vigil.local".to_string(),
        }
    }

    #[test]
    fn data_counts_and_common_labels() {
        let data = TemplateData::new(&notification(), "http://vigil.local");
        assert_eq!(data.num_firing, 1);
        assert_eq!(data.num_resolved, 1);
        assert_eq!(data.status, AlertStatus::Firing);
        assert_eq!(data.common_labels, Labels::new().with("alertname", "HighCPU"));
        assert_eq!(data.common_annotations["summary"], "cpu high");
        assert!(data.alerts[0].labels.get("__alert_rule_uid__").is_none());
    }

    #[test]
    fn default_title_shows_status_and_group() {
        let data = TemplateData::new(&notification(), "");
        assert_eq!(data.default_title(), "[FIRING:1] HighCPU");
    }

    #[test]
    fn default_message_lists_sections() {
        let msg = TemplateData::new(&notification(), "").default_message();
        assert!(msg.starts_with("**Firing**"));
        assert!(msg.contains("**Resolved**"));
        assert!(msg.contains(" - host = a"));
    }

    #[test]
    fn render_uses_template_data() {
        let data = TemplateData::new(&notification(), "http://vigil.local");
        let out = render_or(
            &ctx(),
            Some("{{ numFiring }} {{ commonLabels.alertname }} {{ externalURL }}"),
            &data,
            String::new,
        );
        assert_eq!(out, "1 HighCPU http://vigil.local");
    }

    #[test]
    fn render_falls_back_on_failure_or_empty() {
        let data = TemplateData::new(&notification(), "");
        assert_eq!(render_or(&ctx(), Some("{{#if}}"), &data, || "fb".to_string()), "fb");
        assert_eq!(render_or(&ctx(), Some("  "), &data, || "fb".to_string()), "fb");
        assert_eq!(render_or(&ctx(), None, &data, || "fb".to_string()), "fb");
    }
}
