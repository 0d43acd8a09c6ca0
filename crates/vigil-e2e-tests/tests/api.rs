//! End-to-end tests for the HTTP API.
//!
//! These tests verify:
//! 1. A rule group survives a POST/GET round trip
//! 2. A posted rule goes from inactive to firing in the Prometheus view
//! 3. Re-posting an identical Alertmanager configuration is a no-op
//! 4. Silence permissions differ between viewers and admins
//! 5. Every replica serves the same rule state

mod helpers;

use axum::http::StatusCode;
use helpers::{Cluster, send};
use serde_json::{Value, json};
use vigil_alerts::Clock;

fn posted_group() -> Value {
    json!({
        "name": "db",
        "interval": "10s",
        "rules": [{
            "uid": "disk-full",
            "title": "DiskFull",
            "condition": "A",
            "data": [{
                "ref_id": "A",
                "datasource_uid": "__constant__",
                "model": {"value": 1}
            }],
            "no_data_state": "NoData",
            "exec_err_state": "Error",
            "labels": {"severity": "critical"},
            "annotations": {"summary": "disk is full"}
        }]
    })
}

fn slack_config() -> Value {
    json!({
        "template_files": {},
        "alertmanager_config": {
            "route": {"receiver": "slack", "group_by": ["alertname"]},
            "receivers": [{
                "name": "slack",
                "grafana_managed_receiver_configs": [{
                    "uid": "slack-1",
                    "name": "slack",
                    "type": "slack",
                    "settings": {"recipient": "#alerts"},
                    "secureSettings": {"url": "https://hooks.slack.test/services/T0/B0/X"}
                }]
            }]
        }
    })
}

#[tokio::test]
async fn test_rule_group_round_trip() {
    let cluster = Cluster::single();
    let app = cluster.router(0);

    let (status, _) = send(
        &app,
        "POST",
        "/api/ruler/rules/infra",
        Some("Editor"),
        Some(posted_group()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, json) = send(&app, "GET", "/api/ruler/rules/infra/db", Some("Viewer"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], "db");
    assert_eq!(json["interval"], "10s");

    let posted = &posted_group()["rules"][0];
    let stored = &json["rules"][0];
    for field in ["uid", "title", "condition", "no_data_state", "exec_err_state", "labels", "annotations"] {
        assert_eq!(stored[field], posted[field], "field {field} differs");
    }
    assert_eq!(stored["data"][0]["ref_id"], "A");
    assert_eq!(stored["data"][0]["datasource_uid"], "__constant__");
    assert_eq!(stored["data"][0]["model"], posted["data"][0]["model"]);
    assert_eq!(stored["org_id"], 1);
    assert_eq!(stored["folder_uid"], "infra");
    assert_eq!(stored["rule_group"], "db");
    assert_eq!(stored["version"], 1);

    // Posting the same group again keeps the version.
    send(&app, "POST", "/api/ruler/rules/infra", Some("Editor"), Some(posted_group())).await;
    let (_, json) = send(&app, "GET", "/api/ruler/rules/infra/db", Some("Viewer"), None).await;
    assert_eq!(json["rules"][0]["version"], 1);
}

#[tokio::test]
async fn test_rule_goes_from_inactive_to_firing() {
    let cluster = Cluster::start(2);
    let app = cluster.router(0);
    send(&app, "POST", "/api/ruler/rules/infra", Some("Editor"), Some(posted_group())).await;

    let (_, json) = send(&app, "GET", "/api/prometheus/api/v1/rules", Some("Viewer"), None).await;
    assert_eq!(json["data"]["groups"][0]["rules"][0]["state"], "inactive");

    cluster.rounds(1).await;

    // The follower answers from the shared stores.
    let follower = cluster.router(1);
    let (status, json) =
        send(&follower, "GET", "/api/prometheus/api/v1/rules", Some("Viewer"), None).await;
    assert_eq!(status, StatusCode::OK);
    let rule = &json["data"]["groups"][0]["rules"][0];
    assert_eq!(rule["state"], "firing");
    assert_eq!(rule["health"], "ok");
    assert_eq!(rule["alerts"][0]["state"], "Alerting");
    assert_eq!(rule["alerts"][0]["labels"]["severity"], "critical");

    let (_, json) = send(&follower, "GET", "/api/prometheus/api/v1/alerts", Some("Viewer"), None).await;
    assert_eq!(json["data"]["alerts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_identical_config_post_is_a_no_op() {
    let cluster = Cluster::single();
    let app = cluster.router(0);
    let uri = "/api/alertmanager/config/api/v1/alerts";

    let (status, _) = send(&app, "POST", uri, Some("Admin"), Some(slack_config())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, history) = send(&app, "GET", "/api/alertmanager/config/history", Some("Admin"), None).await;
    let entries = history.as_array().unwrap().len();

    let (status, _) = send(&app, "POST", uri, Some("Admin"), Some(slack_config())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, history) = send(&app, "GET", "/api/alertmanager/config/history", Some("Admin"), None).await;
    assert_eq!(history.as_array().unwrap().len(), entries);

    // Secrets are never returned.
    let (_, config) = send(&app, "GET", uri, Some("Admin"), None).await;
    let integration = &config["alertmanager_config"]["receivers"][0]["grafana_managed_receiver_configs"][0];
    assert!(integration.get("secureSettings").is_none());
    assert_eq!(integration["secureFields"]["url"], true);
}

#[tokio::test]
async fn test_silence_permissions() {
    let cluster = Cluster::single();
    let app = cluster.router(0);
    let now = cluster.clock.now();
    let silence = json!({
        "matchers": [{"name": "team", "value": "db", "isRegex": false, "isEqual": true}],
        "startsAt": now.to_rfc3339(),
        "endsAt": (now + chrono::Duration::hours(1)).to_rfc3339(),
        "comment": "maintenance"
    });
    let uri = "/api/alertmanager/api/v2/silences";

    let (status, _) = send(&app, "GET", uri, Some("Viewer"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "POST", uri, Some("Viewer"), Some(silence.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, json) = send(&app, "POST", uri, Some("Admin"), Some(silence)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(json["silenceID"].is_string());

    let (_, json) = send(&app, "GET", uri, Some("Viewer"), None).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_anonymous_requests_are_rejected() {
    let cluster = Cluster::single();
    let app = cluster.router(0);
    let (status, _) = send(&app, "GET", "/api/alertmanager/api/v2/silences", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, "GET", "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}
