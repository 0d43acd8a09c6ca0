//! Delivery with timeouts and retries.
//!
//! A notification goes to every integration of its receiver concurrently.
//! Each delivery attempt is bounded by a timeout; retryable failures are
//! retried with exponential backoff until the attempt budget runs out. One
//! failing integration never blocks the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use vigil_alerts::AlertingMetrics;

use crate::error::NotifyError;
use crate::integrations::Integration;
use crate::pipeline::{AlertStatus, Notification};

/// Retry and timeout settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Timeout of a single attempt.
    pub timeout: Duration,
    /// Attempts per notification, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl DispatchConfig {
    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.powi(exponent);
        let millis = (self.initial_backoff.as_millis() as f64 * multiplier) as u64;
        Duration::from_millis(millis).min(self.max_backoff)
    }
}

/// Result of delivering to one integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    /// Integration UID.
    pub uid: String,
    /// `name[type]`.
    pub integration: String,
    /// Attempts made.
    pub attempts: u32,
    /// Final error, if delivery failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time.
    pub at: DateTime<Utc>,
}

impl DeliveryOutcome {
    /// True if the notification was delivered.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Delivers notifications for one organisation.
#[derive(Debug)]
pub struct Dispatcher {
    org_id: i64,
    config: DispatchConfig,
    metrics: AlertingMetrics,
    last: Arc<RwLock<HashMap<String, DeliveryOutcome>>>,
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Self {
            org_id: self.org_id,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            last: Arc::clone(&self.last),
        }
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(org_id: i64, config: DispatchConfig, metrics: AlertingMetrics) -> Self {
        Self {
            org_id,
            config,
            metrics,
            last: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Retry settings.
    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Sends a notification to every integration of a receiver.
    ///
    /// Resolved-only notifications skip integrations with
    /// `disable_resolve_message`.
    pub async fn deliver(
        &self,
        integrations: &[Integration],
        notification: &Notification,
    ) -> Vec<DeliveryOutcome> {
        let resolved_only = notification.status() == AlertStatus::Resolved;
        let targets: Vec<&Integration> = integrations
            .iter()
            .filter(|i| !(resolved_only && i.disable_resolve_message))
            .collect();
        if targets.is_empty() {
            debug!(receiver = %notification.receiver, "no integrations to notify");
            return Vec::new();
        }
        let outcomes = join_all(targets.into_iter().map(|i| self.deliver_one(i, notification))).await;

        let mut last = self.last.write();
        for outcome in &outcomes {
            last.insert(outcome.uid.clone(), outcome.clone());
        }
        outcomes
    }

    async fn deliver_one(&self, integration: &Integration, notification: &Notification) -> DeliveryOutcome {
        let label = integration.label();
        let kind = integration.kind.as_str();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.config.timeout, integration.notify(notification)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Delivery {
                    integration: label.clone(),
                    reason: format!("timed out after {}", humantime::format_duration(self.config.timeout)),
                    retryable: true,
                }),
            };
            match result {
                Ok(()) => break None,
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        org_id = self.org_id,
                        integration = %label,
                        attempt,
                        retry_in = ?delay,
                        error = %e,
                        "notification failed, retrying"
                    );
                    self.metrics.inc_notification_retries(self.org_id, kind);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Some(e.to_string()),
            }
        };

        match &error {
            None => {
                self.metrics.inc_notifications_sent(self.org_id, kind);
                info!(
                    org_id = self.org_id,
                    receiver = %notification.receiver,
                    integration = %label,
                    alerts = notification.alerts.len(),
                    status = notification.status().as_str(),
                    "notification sent"
                );
            }
            Some(reason) => {
                self.metrics.inc_notification_failures(self.org_id, kind);
                warn!(
                    org_id = self.org_id,
                    receiver = %notification.receiver,
                    integration = %label,
                    attempts = attempt,
                    error = %reason,
                    "notification failed"
                );
            }
        }
        DeliveryOutcome {
            uid: integration.uid.clone(),
            integration: label,
            attempts: attempt,
            error,
            at: Utc::now(),
        }
    }

    /// Latest outcome of an integration, by UID.
    #[must_use]
    pub fn last_outcome(&self, uid: &str) -> Option<DeliveryOutcome> {
        self.last.read().get(uid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegrationConfig;
    use crate::error::Result;
    use crate::integrations::{IntegrationKind, Notifier};
    use crate::testutil::{notification, resolved};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        retryable: bool,
        hang: bool,
    }

    impl Flaky {
        fn new(fail_first: u32, retryable: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
                retryable,
                hang: false,
            })
        }
    }

    #[async_trait]
    impl Notifier for Flaky {
        async fn notify(&self, _: &Notification) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if n < self.fail_first {
                return Err(NotifyError::Delivery {
                    integration: "flaky".to_string(),
                    reason: "boom".to_string(),
                    retryable: self.retryable,
                });
            }
            Ok(())
        }
    }

    fn integration(uid: &str, notifier: Arc<Flaky>, disable_resolve: bool) -> Integration {
        let mut config = IntegrationConfig::new("webhook", uid).with_uid(uid);
        config.disable_resolve_message = disable_resolve;
        Integration::new(&config, IntegrationKind::Webhook, notifier)
    }

    fn dispatcher(metrics: &AlertingMetrics) -> Dispatcher {
        Dispatcher::new(
            1,
            DispatchConfig::default()
                .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
                .with_timeout(Duration::from_secs(1)),
            metrics.clone(),
        )
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = DispatchConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let metrics = AlertingMetrics::new();
        let flaky = Flaky::new(2, true);
        let outcomes = dispatcher(&metrics)
            .deliver(&[integration("a", Arc::clone(&flaky), false)], &notification(1))
            .await;
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let metrics = AlertingMetrics::new();
        let d = dispatcher(&metrics);
        let outcomes = d
            .deliver(&[integration("a", Flaky::new(10, true), false)], &notification(1))
            .await;
        assert_eq!(outcomes[0].attempts, 3);
        assert!(!outcomes[0].is_success());
        assert_eq!(metrics.notification_failures(1, "webhook"), 1);
        assert!(d.last_outcome("a").unwrap().error.is_some());
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let metrics = AlertingMetrics::new();
        let outcomes = dispatcher(&metrics)
            .deliver(&[integration("a", Flaky::new(1, false), false)], &notification(1))
            .await;
        assert_eq!(outcomes[0].attempts, 1);
        assert!(!outcomes[0].is_success());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let metrics = AlertingMetrics::new();
        let good = Flaky::new(0, true);
        let outcomes = dispatcher(&metrics)
            .deliver(
                &[
                    integration("bad", Flaky::new(10, false), false),
                    integration("good", Arc::clone(&good), false),
                ],
                &notification(1),
            )
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[1].is_success());
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolved_only_skips_disabled_integrations() {
        let metrics = AlertingMetrics::new();
        let skipped = Flaky::new(0, true);
        let outcomes = dispatcher(&metrics)
            .deliver(
                &[integration("quiet", Arc::clone(&skipped), true)],
                &resolved(notification(1)),
            )
            .await;
        assert!(outcomes.is_empty());
        assert_eq!(skipped.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_integration_times_out() {
        let metrics = AlertingMetrics::new();
        let hanging = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 0,
            retryable: true,
            hang: true,
        });
        let d = Dispatcher::new(
            1,
            DispatchConfig::default()
                .with_timeout(Duration::from_secs(5))
                .with_max_attempts(2),
            metrics,
        );
        let outcomes = d.deliver(&[integration("h", hanging, false)], &notification(1)).await;
        assert_eq!(outcomes[0].attempts, 2);
        assert!(outcomes[0].error.as_deref().unwrap().contains("timed out"));
    }
}
