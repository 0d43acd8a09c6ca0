//! Log integration: writes each alert as a structured log line.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::template::TemplateData;
use super::{Notifier, NotifyContext, settings};
use crate::config::IntegrationConfig;
use crate::error::Result;
use crate::pipeline::{AlertStatus, Notification};

#[derive(Debug, Clone, Default, Deserialize)]
struct LogSettings {
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Debug)]
pub(super) struct LogNotifier {
    name: String,
    prefix: String,
    ctx: Arc<NotifyContext>,
}

impl LogNotifier {
    pub(super) fn new(
        config: &IntegrationConfig,
        ctx: Arc<NotifyContext>,
    ) -> std::result::Result<Self, String> {
        let settings: LogSettings = settings(config)?;
        Ok(Self {
            name: config.name.clone(),
            prefix: settings.prefix.unwrap_or_default(),
            ctx,
        })
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let data = TemplateData::new(notification, &self.ctx.external_url);
        for alert in &data.alerts {
            match alert.status {
                AlertStatus::Firing => warn!(
                    integration = %self.name,
                    receiver = %data.receiver,
                    prefix = %self.prefix,
                    labels = %alert.labels,
                    starts_at = %alert.starts_at,
                    "ALERT"
                ),
                AlertStatus::Resolved => info!(
                    integration = %self.name,
                    receiver = %data.receiver,
                    prefix = %self.prefix,
                    labels = %alert.labels,
                    ends_at = %alert.ends_at,
                    "RESOLVED"
                ),
            }
        }
        Ok(())
    }
}
