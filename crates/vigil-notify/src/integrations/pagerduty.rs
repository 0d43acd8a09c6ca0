//! PagerDuty Events API v2 integration.
//!
//! Each aggregation group maps to one PagerDuty incident: the dedup key is
//! derived from the group key, firing notifications trigger it and resolved
//! ones resolve it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::template::{TemplateData, render_or};
use super::{Notifier, NotifyContext, check_status, parse_url, settings, transport_error};
use crate::config::IntegrationConfig;
use crate::error::Result;
use crate::pipeline::{AlertStatus, Notification};

/// Default Events API v2 endpoint.
pub const PAGERDUTY_EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

const SEVERITIES: [&str; 4] = ["critical", "error", "warning", "info"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PagerDutySettings {
    #[serde(default)]
    integration_key: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    class: Option<String>,
    #[serde(default)]
    component: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// An Events API v2 event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagerDutyEvent {
    /// Integration key.
    pub routing_key: String,
    /// Incident identity.
    pub dedup_key: String,
    /// `trigger` or `resolve`.
    pub event_action: String,
    /// Event details; absent on resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<PagerDutyPayload>,
    /// Sender name.
    pub client: String,
    /// Sender link.
    pub client_url: String,
}

/// Body of a trigger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagerDutyPayload {
    /// One-line summary.
    pub summary: String,
    /// Affected system.
    pub source: String,
    /// `critical`, `error`, `warning` or `info`.
    pub severity: String,
    /// Event class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Affected component.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    /// Logical group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Extra fields.
    pub custom_details: BTreeMap<String, String>,
}

#[derive(Debug)]
pub(super) struct PagerDutyNotifier {
    label: String,
    url: reqwest::Url,
    severity: String,
    settings: PagerDutySettings,
    client: reqwest::Client,
    ctx: Arc<NotifyContext>,
}

impl PagerDutyNotifier {
    pub(super) fn new(
        config: &IntegrationConfig,
        client: reqwest::Client,
        ctx: Arc<NotifyContext>,
    ) -> std::result::Result<Self, String> {
        let settings: PagerDutySettings = settings(config)?;
        if settings.integration_key.trim().is_empty() {
            return Err("could not find integration key property in settings".to_string());
        }
        let severity = settings
            .severity
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "critical".to_string());
        if !severity.contains("{{") && !SEVERITIES.contains(&severity.as_str()) {
            return Err(format!("invalid severity {severity:?}"));
        }
        let url = parse_url(
            "url",
            settings.url.as_deref().filter(|u| !u.is_empty()).unwrap_or(PAGERDUTY_EVENTS_URL),
        )?;
        Ok(Self {
            label: format!("{}[pagerduty]", config.name),
            url,
            severity,
            settings,
            client,
            ctx,
        })
    }

    fn event(&self, notification: &Notification) -> PagerDutyEvent {
        let data = TemplateData::new(notification, &self.ctx.external_url);
        let dedup_key = blake3::hash(notification.group_key.as_bytes()).to_hex().to_string();
        let resolve = notification.status() == AlertStatus::Resolved;

        let payload = (!resolve).then(|| {
            let summary = render_or(&self.ctx, self.settings.summary.as_deref(), &data, || {
                data.default_title()
            });
            let mut custom_details = BTreeMap::new();
            custom_details.insert("firing".to_string(), data.num_firing.to_string());
            custom_details.insert("resolved".to_string(), data.num_resolved.to_string());
            custom_details.insert("num_firing".to_string(), data.num_firing.to_string());
            custom_details.insert("details".to_string(), data.default_message());
            let render = |field: &Option<String>| {
                field
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .map(|s| render_or(&self.ctx, Some(s), &data, || s.to_string()))
            };
            PagerDutyPayload {
                // PagerDuty rejects summaries over 1024 characters.
                summary: summary.chars().take(1024).collect(),
                source: render(&self.settings.source).unwrap_or_else(|| "vigil".to_string()),
                severity: render_or(&self.ctx, Some(&self.severity), &data, || {
                    "critical".to_string()
                }),
                class: render(&self.settings.class),
                component: render(&self.settings.component),
                group: render(&self.settings.group),
                custom_details,
            }
        });

        PagerDutyEvent {
            routing_key: self.settings.integration_key.trim().to_string(),
            dedup_key,
            event_action: if resolve { "resolve" } else { "trigger" }.to_string(),
            payload,
            client: "Vigil".to_string(),
            client_url: self.ctx.external_url.clone(),
        }
    }
}

#[async_trait]
impl Notifier for PagerDutyNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let event = self.event(notification);
        let response = self
            .client
            .post(self.url.clone())
            .json(&event)
            .send()
            .await
            .map_err(|e| transport_error(&self.label, &e))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        check_status(&self.label, status, &body)?;
        debug!(
            integration = %self.label,
            action = %event.event_action,
            dedup_key = %event.dedup_key,
            "pagerduty event sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertmanagerConfig;
    use crate::integrations::{Integration, IntegrationFactory};
    use crate::testutil::{notification, resolved, serve};
    use axum::http::StatusCode;

    fn try_build(config: &IntegrationConfig) -> Result<Integration> {
        let factory = IntegrationFactory::new("http://vigil.local");
        let ctx = factory.context(&AlertmanagerConfig::default()).unwrap();
        factory.build(config, &ctx)
    }

    #[test]
    fn integration_key_required() {
        let err = try_build(&IntegrationConfig::new("pagerduty", "pd")).unwrap_err();
        assert!(err.to_string().contains("integration key"));
    }

    #[test]
    fn invalid_severity_rejected() {
        let config = IntegrationConfig::new("pagerduty", "pd")
            .with_secure_setting("integrationKey", "k")
            .with_setting("severity", "apocalyptic");
        assert!(try_build(&config).is_err());
    }

    #[tokio::test]
    async fn trigger_then_resolve_share_dedup_key() {
        let (base, requests) = serve(StatusCode::ACCEPTED, "{}").await;
        let pd = try_build(
            &IntegrationConfig::new("pagerduty", "pd")
                .with_secure_setting("integrationKey", "key-1")
                .with_setting("url", format!("{base}/v2/enqueue"))
                .with_setting("severity", "warning"),
        )
        .unwrap();
        pd.notify(&notification(2)).await.unwrap();
        pd.notify(&resolved(notification(2))).await.unwrap();

        let requests = requests.lock();
        let trigger = &requests[0].body;
        let resolve = &requests[1].body;
        assert_eq!(trigger["event_action"], "trigger");
        assert_eq!(trigger["routing_key"], "key-1");
        assert_eq!(trigger["payload"]["severity"], "warning");
        assert_eq!(trigger["payload"]["summary"], "[FIRING:2] HighCPU");
        assert_eq!(resolve["event_action"], "resolve");
        assert!(resolve.get("payload").is_none());
        assert_eq!(trigger["dedup_key"], resolve["dedup_key"]);
    }
}
