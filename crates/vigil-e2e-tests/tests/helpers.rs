//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{Method, Request, StatusCode, Uri};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tower::ServiceExt;
use vigil_alerts::{
    AlertQuery, AlertRule, Clock, ManualClock, MemoryMembership, MemoryRuleStore,
    MemoryStateStore, Role, RuleGroup,
};
use vigil_notify::{AdminConfigStore, ConfigStore, IntegrationFactory, SecretsService};
use vigil_server::auth::{ORG_HEADER, ROLE_HEADER, USER_HEADER};
use vigil_server::{AppState, EngineBuilder, ServerConfig, create_router};

/// Base evaluation interval of every test cluster.
pub const BASE_INTERVAL: Duration = Duration::from_secs(10);

/// Replicas sharing stores and a manual clock, stepped by hand.
pub struct Cluster {
    pub clock: Arc<ManualClock>,
    pub rules: Arc<MemoryRuleStore>,
    pub states: Arc<MemoryStateStore>,
    pub replicas: Vec<Arc<AppState>>,
}

impl Cluster {
    /// Builds `size` replicas named `vigil-0`, `vigil-1`, ...
    pub fn start(size: usize) -> Self {
        let start: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let rules = Arc::new(MemoryRuleStore::new());
        let states = Arc::new(MemoryStateStore::new());
        let membership = Arc::new(MemoryMembership::new());
        let configs = ConfigStore::new(
            SecretsService::new(b"e2e secret key"),
            IntegrationFactory::new("http://vigil.test"),
            Arc::clone(&shared_clock),
        );
        let admin = AdminConfigStore::new();

        let replicas = (0..size)
            .map(|i| {
                let config = ServerConfig::default()
                    .with_peer_name(format!("vigil-{i}"))
                    .with_base_interval(BASE_INTERVAL)
                    .with_external_url("http://vigil.test");
                let state = EngineBuilder::new(config)
                    .with_clock(Arc::clone(&shared_clock))
                    .with_rule_store(rules.clone())
                    .with_state_store(states.clone())
                    .with_membership(membership.clone())
                    .with_config_store(configs.clone())
                    .with_admin_store(admin.clone())
                    .build()
                    .unwrap();
                Arc::new(state)
            })
            .collect();

        Self {
            clock,
            rules,
            states,
            replicas,
        }
    }

    /// A single replica.
    pub fn single() -> Self {
        Self::start(1)
    }

    /// The first replica.
    pub fn primary(&self) -> &Arc<AppState> {
        &self.replicas[0]
    }

    /// Advances the clock by one base interval, then steps the replicas in
    /// `alive` in order and waits for their evaluations.
    pub async fn round(&self, alive: &[usize]) {
        self.clock.advance(BASE_INTERVAL);
        for &i in alive {
            self.replicas[i].step().await;
        }
        for &i in alive {
            self.replicas[i].wait_idle().await;
        }
    }

    /// Runs `count` rounds with every replica alive.
    pub async fn rounds(&self, count: usize) {
        let all: Vec<usize> = (0..self.replicas.len()).collect();
        for _ in 0..count {
            self.round(&all).await;
        }
    }

    /// Indices of the replicas that currently evaluate.
    pub fn evaluators(&self) -> Vec<usize> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.coordinator().role() == Role::Evaluator)
            .map(|(i, _)| i)
            .collect()
    }

    /// Router of replica `i`.
    pub fn router(&self, i: usize) -> Router {
        create_router(Arc::clone(&self.replicas[i]))
    }
}

/// A rule whose condition is always true, using the built-in constant
/// datasource.
pub fn always_firing(uid: &str, title: &str) -> AlertRule {
    AlertRule::builder(title, "A")
        .uid(uid)
        .query(AlertQuery::new("A", json!({"value": 1})).datasource("__constant__"))
        .label("team", "db")
        .build()
        .unwrap()
}

/// A group in org 1 holding `rules`, evaluated every base interval.
pub fn group(folder: &str, name: &str, rules: Vec<AlertRule>) -> RuleGroup {
    RuleGroup::new(1, folder, name, BASE_INTERVAL, rules)
}

/// Sends a request as a user with `role` in org 1, or anonymously.
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    role: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(role) = role {
        builder = builder
            .header(USER_HEADER, format!("{}-user", role.to_lowercase()))
            .header(ROLE_HEADER, role)
            .header(ORG_HEADER, "1");
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

/// A request seen by a [`FakeAlertmanager`].
#[derive(Debug, Clone)]
pub struct Captured {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

/// An HTTP server standing in for an external Alertmanager.
pub struct FakeAlertmanager {
    pub url: String,
    pub requests: Arc<Mutex<Vec<Captured>>>,
}

impl FakeAlertmanager {
    /// Starts a server answering 200 to everything.
    pub async fn start() -> Self {
        let requests: Arc<Mutex<Vec<Captured>>> = Arc::default();
        let sink = Arc::clone(&requests);
        let app = Router::new().fallback(move |method: Method, uri: Uri, raw: Bytes| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(Captured {
                    method,
                    path: uri.path().to_string(),
                    body: serde_json::from_slice(&raw).unwrap_or(Value::Null),
                });
                StatusCode::OK
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.ok() });
        Self {
            url: format!("http://{addr}"),
            requests,
        }
    }

    /// Paths requested so far.
    pub fn paths(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.path.clone()).collect()
    }
}
