//! Slack integration.
//!
//! Either posts to an incoming-webhook `url`, or, with a `token`, calls the
//! `chat.postMessage` API for `recipient`. The chat API answers 200 even on
//! failure and reports errors in the body as `{"ok": false, "error": ...}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::template::{TemplateData, render_or};
use super::{Notifier, NotifyContext, check_status, parse_url, settings, transport_error};
use crate::config::IntegrationConfig;
use crate::error::{NotifyError, Result};
use crate::pipeline::{AlertStatus, Notification};

/// Endpoint of Slack's chat API.
pub const SLACK_CHAT_API_URL: &str = "https://slack.com/api/chat.postMessage";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlackSettings {
    #[serde(default)]
    url: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    recipient: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    icon_emoji: Option<String>,
    #[serde(default, rename = "iconURL", alias = "iconUrl")]
    icon_url: Option<String>,
    #[serde(default)]
    mention_channel: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
pub(super) struct SlackNotifier {
    label: String,
    url: reqwest::Url,
    chat_api: bool,
    settings: SlackSettings,
    client: reqwest::Client,
    ctx: Arc<NotifyContext>,
}

impl SlackNotifier {
    pub(super) fn new(
        config: &IntegrationConfig,
        client: reqwest::Client,
        ctx: Arc<NotifyContext>,
    ) -> std::result::Result<Self, String> {
        let settings: SlackSettings = settings(config)?;
        let token = settings.token.trim();
        let raw_url = settings.url.trim();
        if token.is_empty() && raw_url.is_empty() {
            return Err("token or url must be specified".to_string());
        }
        let url = if raw_url.is_empty() {
            SLACK_CHAT_API_URL
        } else {
            raw_url
        };
        let chat_api = url == SLACK_CHAT_API_URL;
        if chat_api && token.is_empty() {
            return Err("token must be specified when using the Slack chat API".to_string());
        }
        if chat_api && settings.recipient.trim().is_empty() {
            return Err("recipient must be specified when using the Slack chat API".to_string());
        }
        if let Some(mention) = settings.mention_channel.as_deref() {
            if !matches!(mention, "" | "here" | "channel") {
                return Err(format!("invalid value for mentionChannel: {mention:?}"));
            }
        }
        let url = parse_url("url", url)?;
        Ok(Self {
            label: format!("{}[slack]", config.name),
            url,
            chat_api,
            settings,
            client,
            ctx,
        })
    }

    fn payload(&self, notification: &Notification) -> serde_json::Value {
        let data = TemplateData::new(notification, &self.ctx.external_url);
        let title = render_or(&self.ctx, self.settings.title.as_deref(), &data, || {
            data.default_title()
        });
        let mut text = render_or(&self.ctx, self.settings.text.as_deref(), &data, || {
            data.default_message()
        });
        if let Some(mention) = self.settings.mention_channel.as_deref().filter(|m| !m.is_empty()) {
            text = format!("<!{mention}|{mention}>\n{text}");
        }
        let color = match notification.status() {
            AlertStatus::Firing => "#D63232",
            AlertStatus::Resolved => "#36a64f",
        };
        let title_link = data
            .alerts
            .first()
            .map(|a| a.generator_url.clone())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("{}/alerting/list", data.external_url));

        let mut payload = json!({
            "attachments": [{
                "color": color,
                "title": title,
                "title_link": title_link,
                "text": text,
                "fallback": title,
                "footer": "Vigil",
                "ts": notification.at.timestamp(),
            }]
        });
        if let Some(obj) = payload.as_object_mut() {
            if !self.settings.recipient.is_empty() {
                obj.insert("channel".into(), json!(self.settings.recipient));
            }
            if let Some(username) = self.settings.username.as_deref().filter(|u| !u.is_empty()) {
                obj.insert("username".into(), json!(username));
            }
            if let Some(emoji) = self.settings.icon_emoji.as_deref().filter(|e| !e.is_empty()) {
                obj.insert("icon_emoji".into(), json!(emoji));
            }
            if let Some(icon) = self.settings.icon_url.as_deref().filter(|i| !i.is_empty()) {
                obj.insert("icon_url".into(), json!(icon));
            }
        }
        payload
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let payload = self.payload(notification);
        let mut request = self.client.post(self.url.clone()).json(&payload);
        if !self.settings.token.is_empty() {
            request = request.bearer_auth(self.settings.token.trim());
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.label, &e))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        check_status(&self.label, status, &body)?;

        if self.chat_api {
            let parsed: ChatResponse =
                serde_json::from_str(&body).map_err(|e| NotifyError::Delivery {
                    integration: self.label.clone(),
                    reason: format!("failed to parse chat API response: {e}"),
                    retryable: false,
                })?;
            if !parsed.ok {
                return Err(NotifyError::Delivery {
                    integration: self.label.clone(),
                    reason: format!(
                        "chat API error: {}",
                        parsed.error.as_deref().unwrap_or("unknown")
                    ),
                    retryable: false,
                });
            }
        }
        debug!(integration = %self.label, chat_api = self.chat_api, "slack message sent");
        Ok(())
    }
}
