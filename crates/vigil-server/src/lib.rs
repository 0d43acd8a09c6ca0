//! # vigil-server
//!
//! HTTP API and process wiring for the Vigil alerting service.
//!
//! A replica evaluates alert rules on a shared schedule, elects a single
//! evaluator with its peers, hands firing alerts to the per-organisation
//! Alertmanagers and serves the ruler, Prometheus-compatible, Alertmanager,
//! provisioning and admin APIs over axum.
//!
//! ## Features
//!
//! - **Engine wiring**: [`EngineBuilder`] connects rule and state stores,
//!   the HA coordinator, the scheduler and the notification side; every
//!   collaborator can be swapped for tests or shared between replicas
//! - **Access control**: users come from trusted proxy headers and are
//!   checked per action and folder
//! - **Graceful shutdown**: the listener closes first, then in-flight
//!   evaluations drain
//!
//! ## Example
//!
//! ```rust,no_run
//! use vigil_server::{ServerConfig, VigilServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default().with_peer_name("vigil-0");
//!     let server = VigilServer::new(config).unwrap();
//!     // server.serve_with_shutdown("0.0.0.0:9093".parse().unwrap(), async {}).await.unwrap();
//! }
//! ```
//!
//! ## API Endpoints
//!
//! | Endpoint | Description |
//! |----------|-------------|
//! | `/api/ruler/rules/...` | Rule groups per folder |
//! | `/api/prometheus/api/v1/{rules,alerts}` | Rule and alert state |
//! | `/api/alertmanager/config/...` | Notification configuration and history |
//! | `/api/alertmanager/api/v2/...` | Alerts, groups, status and silences |
//! | `/api/v1/provisioning/...` | Policies, contact points, templates, mute timings |
//! | `/api/v1/ngalert/...` | External Alertmanagers |
//! | `/api/health` | Replica health and HA role |
//! | `/metrics` | OpenMetrics exposition |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;

// Re-export main types at crate root
pub use auth::{AccessControl, Action, BasicAccessControl, OrgRole, Scope, User};
pub use config::ServerConfig;
pub use engine::EngineBuilder;
pub use error::{ApiError, ApiResult, ServerError, ServerResult};
pub use routes::create_router;
pub use server::VigilServer;
pub use state::AppState;
