//! Generic webhook integration.
//!
//! Posts an Alertmanager-compatible JSON document (version 4) extended with
//! rendered `title` and `message` fields.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_alerts::Labels;

use super::template::{TemplateAlert, TemplateData, render_or};
use super::{Notifier, NotifyContext, check_status, parse_url, settings, transport_error};
use crate::config::IntegrationConfig;
use crate::error::Result;
use crate::pipeline::Notification;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookSettings {
    #[serde(default)]
    url: String,
    #[serde(default)]
    http_method: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    max_alerts: usize,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// The JSON document posted by the webhook integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Payload format version.
    pub version: String,
    /// Aggregation group key.
    pub group_key: String,
    /// Alerts dropped because of `maxAlerts`.
    pub truncated_alerts: usize,
    /// Overall status.
    pub status: String,
    /// Receiver name.
    pub receiver: String,
    /// Grouping labels.
    pub group_labels: Labels,
    /// Labels shared by every alert.
    pub common_labels: Labels,
    /// Annotations shared by every alert.
    pub common_annotations: BTreeMap<String, String>,
    /// Public URL.
    #[serde(rename = "externalURL")]
    pub external_url: String,
    /// The alerts.
    pub alerts: Vec<WebhookAlert>,
    /// Rendered title.
    pub title: String,
    /// Rendered message.
    pub message: String,
}

/// Alert format in webhook payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAlert {
    /// `firing` or `resolved`.
    pub status: String,
    /// Labels.
    pub labels: Labels,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// RFC 3339 start time.
    pub starts_at: String,
    /// RFC 3339 end time.
    pub ends_at: String,
    /// Rule link.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    /// Label fingerprint.
    pub fingerprint: String,
}

impl From<&TemplateAlert> for WebhookAlert {
    fn from(alert: &TemplateAlert) -> Self {
        Self {
            status: alert.status.as_str().to_string(),
            labels: alert.labels.clone(),
            annotations: alert.annotations.clone(),
            starts_at: alert.starts_at.to_rfc3339(),
            ends_at: alert.ends_at.to_rfc3339(),
            generator_url: alert.generator_url.clone(),
            fingerprint: alert.fingerprint.clone(),
        }
    }
}

impl WebhookPayload {
    /// Builds the payload, keeping at most `max_alerts` alerts when non-zero.
    #[must_use]
    pub fn new(data: &TemplateData, max_alerts: usize, title: String, message: String) -> Self {
        let keep = if max_alerts == 0 {
            data.alerts.len()
        } else {
            max_alerts.min(data.alerts.len())
        };
        Self {
            version: "4".to_string(),
            group_key: data.group_key.clone(),
            truncated_alerts: data.alerts.len() - keep,
            status: data.status.as_str().to_string(),
            receiver: data.receiver.clone(),
            group_labels: data.group_labels.clone(),
            common_labels: data.common_labels.clone(),
            common_annotations: data.common_annotations.clone(),
            external_url: data.external_url.clone(),
            alerts: data.alerts.iter().take(keep).map(WebhookAlert::from).collect(),
            title,
            message,
        }
    }
}

#[derive(Debug)]
pub(super) struct WebhookNotifier {
    label: String,
    url: reqwest::Url,
    method: reqwest::Method,
    settings: WebhookSettings,
    client: reqwest::Client,
    ctx: Arc<NotifyContext>,
}

impl WebhookNotifier {
    pub(super) fn new(
        config: &IntegrationConfig,
        client: reqwest::Client,
        ctx: Arc<NotifyContext>,
    ) -> std::result::Result<Self, String> {
        let settings: WebhookSettings = settings(config)?;
        let url = parse_url("url", &settings.url)?;
        let method = match settings.http_method.as_deref().map(str::to_uppercase).as_deref() {
            None | Some("" | "POST") => reqwest::Method::POST,
            Some("PUT") => reqwest::Method::PUT,
            Some(other) => return Err(format!("unsupported HTTP method {other:?}")),
        };
        if settings.password.is_some() && settings.username.as_deref().is_none_or(str::is_empty) {
            return Err("username must be set when a password is configured".to_string());
        }
        Ok(Self {
            label: format!("{}[webhook]", config.name),
            url,
            method,
            settings,
            client,
            ctx,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let data = TemplateData::new(notification, &self.ctx.external_url);
        let title = render_or(&self.ctx, self.settings.title.as_deref(), &data, || {
            data.default_title()
        });
        let message = render_or(&self.ctx, self.settings.message.as_deref(), &data, || {
            data.default_message()
        });
        let payload = WebhookPayload::new(&data, self.settings.max_alerts, title, message);

        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .json(&payload);
        if let Some(user) = self.settings.username.as_deref().filter(|u| !u.is_empty()) {
            request = request.basic_auth(user, self.settings.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.label, &e))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        check_status(&self.label, status, &body)?;
        debug!(
            integration = %self.label,
            alerts = payload.alerts.len(),
            status = notification.status().as_str(),
            "webhook delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertmanagerConfig;
    use crate::integrations::{Integration, IntegrationFactory};
    use crate::testutil::{notification, serve};
    use axum::http::StatusCode;

    fn build(config: IntegrationConfig) -> Integration {
        let factory = IntegrationFactory::new("http://vigil.local");
        let ctx = factory.context(&AlertmanagerConfig::default()).unwrap();
        factory.build(&config, &ctx).unwrap()
    }

    #[test]
    fn url_is_required() {
        let factory = IntegrationFactory::new("");
        let ctx = factory.context(&AlertmanagerConfig::default()).unwrap();
        let err = factory
            .build(&IntegrationConfig::new("webhook", "hook"), &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("required field 'url' is not specified"));
    }

    #[tokio::test]
    async fn posts_version_4_payload() {
        let (base, requests) = serve(StatusCode::OK, "").await;
        let hook = build(
            IntegrationConfig::new("webhook", "hook")
                .with_setting("url", format!("{base}/hook"))
                .with_setting("maxAlerts", 2)
                .with_setting("title", "{{ numFiring }} firing"),
        );
        hook.notify(&notification(3)).await.unwrap();

        let requests = requests.lock();
        assert_eq!(requests[0].path, "/hook");
        let body = &requests[0].body;
        assert_eq!(body["version"], "4");
        assert_eq!(body["status"], "firing");
        assert_eq!(body["receiver"], "ops");
        assert_eq!(body["truncatedAlerts"], 1);
        assert_eq!(body["alerts"].as_array().unwrap().len(), 2);
        assert_eq!(body["title"], "3 firing");
        assert_eq!(body["externalURL"], "http://vigil.local");
    }

    #[tokio::test]
    async fn put_method_and_basic_auth() {
        let (base, requests) = serve(StatusCode::OK, "").await;
        let hook = build(
            IntegrationConfig::new("webhook", "hook")
                .with_setting("url", base.as_str())
                .with_setting("httpMethod", "put")
                .with_setting("username", "vigil")
                .with_secure_setting("password", "s3cret"),
        );
        hook.notify(&notification(1)).await.unwrap();
        let requests = requests.lock();
        assert_eq!(requests[0].method, axum::http::Method::PUT);
        let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("Basic "));
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let (base, _) = serve(StatusCode::SERVICE_UNAVAILABLE, "down").await;
        let hook = build(IntegrationConfig::new("webhook", "hook").with_setting("url", base.as_str()));
        let err = hook.notify(&notification(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn client_error_is_not_retryable() {
        let (base, _) = serve(StatusCode::BAD_REQUEST, "").await;
        let hook = build(IntegrationConfig::new("webhook", "hook").with_setting("url", base.as_str()));
        let err = hook.notify(&notification(1)).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
