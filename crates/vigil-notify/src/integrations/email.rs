//! Email integration.
//!
//! Messages are handed to an [`EmailSender`]. The default sender only logs;
//! deployments that deliver mail plug in their own.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::template::{TemplateData, render_or};
use super::{Notifier, NotifyContext, settings};
use crate::config::IntegrationConfig;
use crate::error::Result;
use crate::pipeline::Notification;

/// A rendered email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// Recipients.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Delivers rendered emails.
#[async_trait]
pub trait EmailSender: Send + Sync + fmt::Debug {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Delivery` on failure.
    async fn send(&self, message: EmailMessage) -> Result<()>;
}

/// Sender that writes each message to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEmailSender;

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<()> {
        info!(
            to = ?message.to,
            subject = %message.subject,
            bytes = message.body.len(),
            "email notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailSettings {
    #[serde(default)]
    addresses: String,
    #[serde(default)]
    single_email: bool,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Splits an address list on `;`, `,` and newlines.
fn split_addresses(raw: &str) -> Vec<String> {
    raw.split([';', ',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug)]
pub(super) struct EmailNotifier {
    addresses: Vec<String>,
    settings: EmailSettings,
    sender: Arc<dyn EmailSender>,
    ctx: Arc<NotifyContext>,
}

impl EmailNotifier {
    pub(super) fn new(
        config: &IntegrationConfig,
        sender: Arc<dyn EmailSender>,
        ctx: Arc<NotifyContext>,
    ) -> std::result::Result<Self, String> {
        let settings: EmailSettings = settings(config)?;
        let addresses = split_addresses(&settings.addresses);
        if addresses.is_empty() {
            return Err("could not find addresses in settings".to_string());
        }
        if let Some(bad) = addresses.iter().find(|a| !a.contains('@')) {
            return Err(format!("invalid email address {bad:?}"));
        }
        Ok(Self {
            addresses,
            settings,
            sender,
            ctx,
        })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let data = TemplateData::new(notification, &self.ctx.external_url);
        let subject = render_or(&self.ctx, self.settings.subject.as_deref(), &data, || {
            data.default_title()
        });
        let body = render_or(&self.ctx, self.settings.message.as_deref(), &data, || {
            data.default_message()
        });

        if self.settings.single_email {
            return self
                .sender
                .send(EmailMessage {
                    to: self.addresses.clone(),
                    subject,
                    body,
                })
                .await;
        }
        for address in &self.addresses {
            self.sender
                .send(EmailMessage {
                    to: vec![address.clone()],
                    subject: subject.clone(),
                    body: body.clone(),
                })
                .await?;
        }
        Ok(())
    }
}
