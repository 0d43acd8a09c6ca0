//! Test helpers: a local HTTP server that records requests.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use chrono::Utc;
use parking_lot::Mutex;
use vigil_alerts::{Labels, PostableAlert};

use crate::pipeline::Notification;

/// A request seen by [`serve`].
#[derive(Debug, Clone)]
pub struct Captured {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

pub type Requests = Arc<Mutex<Vec<Captured>>>;

/// Serves every path with `status` and `body`. Returns the base URL.
pub async fn serve(status: StatusCode, body: &'static str) -> (String, Requests) {
    let requests: Requests = Arc::default();
    let sink = Arc::clone(&requests);
    let app = Router::new().fallback(move |method: Method, uri: Uri, headers: HeaderMap, raw: Bytes| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(Captured {
                method,
                path: uri.path().to_string(),
                headers,
                body: serde_json::from_slice(&raw).unwrap_or(serde_json::Value::Null),
            });
            (status, body)
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.ok() });
    (format!("http://{addr}"), requests)
}

/// A notification with `count` firing alerts.
pub fn notification(count: usize) -> Notification {
    let now = Utc::now();
    Notification {
        receiver: "ops".to_string(),
        group_key: "{}:{alertname=\"HighCPU\"}".to_string(),
        group_labels: Labels::new().with("alertname", "HighCPU"),
        alerts: (0..count)
            .map(|i| PostableAlert {
                labels: Labels::new()
                    .with("alertname", "HighCPU")
                    .with("instance", format!("web-{i}")),
                annotations: std::collections::BTreeMap::new(),
                starts_at: now,
                ends_at: now + chrono::Duration::minutes(5),
                generator_url: "http://vigil.local/alerting/rules/r1".to_string(),
            })
            .collect(),
        at: now,
    }
}

/// The same notification with every alert resolved.
pub fn resolved(mut notification: Notification) -> Notification {
    for alert in &mut notification.alerts {
        alert.ends_at = notification.at - chrono::Duration::seconds(1);
    }
    notification
}
