//! Integrations (contact points).
//!
//! Every integration type turns a [`Notification`] into a call to an
//! external system. Configurations are validated by building them: an
//! integration whose settings cannot be turned into a working [`Notifier`]
//! makes the whole configuration invalid.
//!
//! Supported types:
//!
//! | Type        | Required settings                   |
//! |-------------|-------------------------------------|
//! | `webhook`   | `url`                               |
//! | `slack`     | `url` or `token` (+ `recipient`)    |
//! | `pagerduty` | `integrationKey`                    |
//! | `email`     | `addresses`                         |
//! | `log`       | none                                |

mod email;
mod logger;
mod pagerduty;
mod slack;
pub mod template;
mod webhook;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use vigil_alerts::TemplateEngine;

pub use email::{EmailMessage, EmailSender, LoggingEmailSender};
pub use pagerduty::{PAGERDUTY_EVENTS_URL, PagerDutyEvent, PagerDutyPayload};
pub use slack::SLACK_CHAT_API_URL;
pub use template::TemplateData;
pub use webhook::{WebhookAlert, WebhookPayload};

use crate::config::{AlertmanagerConfig, IntegrationConfig};
use crate::error::{NotifyError, Result};
use crate::pipeline::Notification;

/// Integration types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrationKind {
    /// Generic HTTP webhook.
    Webhook,
    /// Slack incoming webhook or chat API.
    Slack,
    /// PagerDuty Events API v2.
    PagerDuty,
    /// Email through an [`EmailSender`].
    Email,
    /// Structured log line.
    Log,
}

impl IntegrationKind {
    /// Every supported type.
    pub const ALL: [Self; 5] = [
        Self::Webhook,
        Self::Slack,
        Self::PagerDuty,
        Self::Email,
        Self::Log,
    ];

    /// Configuration name of the type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Slack => "slack",
            Self::PagerDuty => "pagerduty",
            Self::Email => "email",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationKind {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| NotifyError::invalid_config(format!("unsupported integration type {s:?}")))
    }
}

/// Delivers notifications for one configured integration.
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Sends one notification.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Delivery`, flagged retryable for transport
    /// failures, 5xx and 429 responses.
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Shared rendering state of one organisation's configuration.
#[derive(Debug)]
pub struct NotifyContext {
    /// Engine with the configuration's template files registered.
    pub templates: TemplateEngine,
    /// Public URL used in links.
    pub external_url: String,
}

/// A built integration.
#[derive(Debug, Clone)]
pub struct Integration {
    /// Integration UID.
    pub uid: String,
    /// Display name.
    pub name: String,
    /// Type.
    pub kind: IntegrationKind,
    /// Skip resolved-only notifications.
    pub disable_resolve_message: bool,
    notifier: Arc<dyn Notifier>,
}

impl Integration {
    /// Wraps a notifier.
    pub fn new(
        config: &IntegrationConfig,
        kind: IntegrationKind,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            uid: config.uid.clone(),
            name: config.name.clone(),
            kind,
            disable_resolve_message: config.disable_resolve_message,
            notifier,
        }
    }

    /// `name[type]`, used in logs, errors and metrics.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}[{}]", self.name, self.kind)
    }

    /// Sends one notification.
    ///
    /// # Errors
    ///
    /// See [`Notifier::notify`].
    pub async fn notify(&self, notification: &Notification) -> Result<()> {
        self.notifier.notify(notification).await
    }
}

/// Builds integrations from configuration.
#[derive(Debug, Clone)]
pub struct IntegrationFactory {
    http: reqwest::Client,
    email: Arc<dyn EmailSender>,
    external_url: String,
}

impl IntegrationFactory {
    /// Creates a factory with a default HTTP client and a logging email sender.
    pub fn new(external_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            email: Arc::new(LoggingEmailSender),
            external_url: external_url.into(),
        }
    }

    /// Replaces the HTTP client.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Replaces the email sender.
    #[must_use]
    pub fn with_email_sender(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email = sender;
        self
    }

    /// Public URL used in links.
    #[must_use]
    pub fn external_url(&self) -> &str {
        &self.external_url
    }

    /// Creates the rendering context for a configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Template` if a template file does not parse.
    pub fn context(&self, config: &AlertmanagerConfig) -> Result<Arc<NotifyContext>> {
        let mut templates = TemplateEngine::new();
        for (name, source) in &config.template_files {
            templates
                .register(name, source)
                .map_err(|e| NotifyError::Template {
                    reason: format!("template {name:?}: {e}"),
                })?;
        }
        Ok(Arc::new(NotifyContext {
            templates,
            external_url: self.external_url.clone(),
        }))
    }

    /// Builds one integration. Secure settings must already be decrypted.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidConfig` naming the integration if its
    /// type is unknown or its settings are invalid.
    pub fn build(&self, config: &IntegrationConfig, ctx: &Arc<NotifyContext>) -> Result<Integration> {
        let wrap = |reason: String| {
            NotifyError::invalid_config(format!(
                "failed to validate integration {:?} (UID {}) of type {:?}: {reason}",
                config.name, config.uid, config.kind
            ))
        };
        let kind: IntegrationKind = config.kind.parse().map_err(|e: NotifyError| match e {
            NotifyError::InvalidConfig { reason } => wrap(reason),
            other => other,
        })?;
        let ctx = Arc::clone(ctx);
        let notifier: Arc<dyn Notifier> = match kind {
            IntegrationKind::Webhook => Arc::new(
                webhook::WebhookNotifier::new(config, self.http.clone(), ctx).map_err(wrap)?,
            ),
            IntegrationKind::Slack => {
                Arc::new(slack::SlackNotifier::new(config, self.http.clone(), ctx).map_err(wrap)?)
            }
            IntegrationKind::PagerDuty => Arc::new(
                pagerduty::PagerDutyNotifier::new(config, self.http.clone(), ctx).map_err(wrap)?,
            ),
            IntegrationKind::Email => Arc::new(
                email::EmailNotifier::new(config, Arc::clone(&self.email), ctx).map_err(wrap)?,
            ),
            IntegrationKind::Log => Arc::new(logger::LogNotifier::new(config, ctx).map_err(wrap)?),
        };
        Ok(Integration::new(config, kind, notifier))
    }

    /// Builds every receiver of a configuration, keyed by receiver name.
    ///
    /// # Errors
    ///
    /// Returns the first template or integration failure.
    pub fn build_receivers(
        &self,
        config: &AlertmanagerConfig,
    ) -> Result<HashMap<String, Vec<Integration>>> {
        let ctx = self.context(config)?;
        config
            .alertmanager_config
            .receivers
            .iter()
            .map(|r| {
                let integrations = r
                    .integrations
                    .iter()
                    .map(|i| self.build(i, &ctx))
                    .collect::<Result<Vec<_>>>()?;
                Ok((r.name.clone(), integrations))
            })
            .collect()
    }

    /// Checks structure, templates and every integration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self, config: &AlertmanagerConfig) -> Result<()> {
        config.validate()?;
        self.build_receivers(config).map(|_| ())
    }
}

/// Plain and secure settings merged into one object and deserialized.
pub(crate) fn settings<T: DeserializeOwned>(
    config: &IntegrationConfig,
) -> std::result::Result<T, String> {
    let mut merged = match &config.settings {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        _ => return Err("settings must be an object".to_string()),
    };
    for (key, value) in &config.secure_settings {
        merged.insert(key.clone(), Value::String(value.clone()));
    }
    serde_json::from_value(Value::Object(merged)).map_err(|e| e.to_string())
}

/// Maps an HTTP response status to a delivery result.
pub(crate) fn check_status(
    integration: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let retryable = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
    let mut reason = format!("unexpected status {status}");
    if !body.is_empty() {
        reason.push_str(": ");
        reason.push_str(&body.chars().take(256).collect::<String>());
    }
    Err(NotifyError::Delivery {
        integration: integration.to_string(),
        reason,
        retryable,
    })
}

/// Wraps a transport error as a retryable delivery failure.
pub(crate) fn transport_error(integration: &str, err: &reqwest::Error) -> NotifyError {
    NotifyError::Delivery {
        integration: integration.to_string(),
        reason: err.to_string(),
        retryable: true,
    }
}

/// Checks that a URL setting is an absolute http(s) URL.
pub(crate) fn parse_url(name: &str, value: &str) -> std::result::Result<reqwest::Url, String> {
    if value.trim().is_empty() {
        return Err(format!("required field '{name}' is not specified"));
    }
    let url = reqwest::Url::parse(value.trim()).map_err(|e| format!("invalid {name}: {e}"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!("invalid {name}: unsupported scheme {:?}", url.scheme()));
    }
    Ok(url)
}
