//! Notification side of the Vigil alerting engine.
//!
//! `vigil-notify` receives alerts from rule evaluation (or straight from the
//! HTTP API), routes them through a per-organisation routing tree, groups
//! them, applies silences, inhibition rules and mute timings, and delivers
//! the resulting notifications to integrations with retries.
//!
//! # Features
//!
//! - **Routing**: tree of matchers with inherited grouping and timing options
//! - **Grouping**: aggregation groups with `group_wait`, `group_interval`
//!   and `repeat_interval` timers driven by an injected clock
//! - **Suppression**: silences, inhibition rules and mute timings
//! - **Integrations**: webhook, Slack, PagerDuty, email and log
//! - **Configuration history**: every accepted configuration is kept, with
//!   integration secrets encrypted at rest
//! - **External Alertmanagers**: configuration push, status checks and alert
//!   forwarding per organisation
//!
//! # Example
//!
//! ```rust
//! use vigil_alerts::Labels;
//! use vigil_notify::{AlertmanagerConfig, RouteTree};
//!
//! let config = AlertmanagerConfig::default();
//! config.validate().unwrap();
//! let tree = RouteTree::new(&config.alertmanager_config.route).unwrap();
//! let routes = tree.route(&Labels::new().with("alertname", "HighCPU"));
//! assert_eq!(routes[0].receiver, "default");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod alertmanager;
pub mod config;
pub mod config_store;
pub mod dispatch;
pub mod distributor;
pub mod error;
pub mod inhibit;
pub mod integrations;
pub mod multiorg;
pub mod mute;
pub mod pipeline;
pub mod route;
pub mod secrets;
pub mod silence;

#[cfg(test)]
mod testutil;

// Re-export main types at crate root
pub use alertmanager::{AlertGroup, Alertmanager, AlertmanagerStatus, GettableAlert};
pub use config::{AlertmanagerConfig, IntegrationConfig, ReceiverConfig, RouteConfig};
pub use config_store::{ConfigStore, HistoryEntry, SaveOutcome};
pub use dispatch::{DeliveryOutcome, DispatchConfig, Dispatcher};
pub use distributor::{
    AdminConfigStore, AdminConfiguration, Distributor, HttpRemoteAlertmanager,
    RemoteAlertmanager, RemoteState, RemoteStatus, SendAlertsTo,
};
pub use error::{NotifyError, Result};
pub use inhibit::Inhibitor;
pub use integrations::{Integration, IntegrationFactory, IntegrationKind};
pub use multiorg::MultiOrgAlertmanager;
pub use mute::MuteTiming;
pub use pipeline::{Notification, Pipeline};
pub use route::RouteTree;
pub use secrets::SecretsService;
pub use silence::{GettableSilence, PostableSilence, Silence, SilenceState, Silences};
