//! Route configuration for the HTTP API.

use std::sync::Arc;

use axum::routing::{Router, get, post, put};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, alertmanager, health, prometheus, provisioning, ruler, silences};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config().cors_origins);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health))
        // Ruler
        .route("/ruler/rules", get(ruler::list_rules))
        .route(
            "/ruler/rules/{namespace}",
            get(ruler::list_namespace).post(ruler::post_group),
        )
        .route(
            "/ruler/rules/{namespace}/{group}",
            get(ruler::get_group).delete(ruler::delete_group),
        )
        // Prometheus compatible
        .route("/prometheus/api/v1/rules", get(prometheus::rules))
        .route("/prometheus/api/v1/alerts", get(prometheus::alerts))
        // Alertmanager configuration
        .route(
            "/alertmanager/config/api/v1/alerts",
            get(alertmanager::get_config)
                .post(alertmanager::post_config)
                .delete(alertmanager::delete_config),
        )
        .route("/alertmanager/config/history", get(alertmanager::history))
        .route(
            "/alertmanager/config/history/{id}/_activate",
            post(alertmanager::activate),
        )
        // Alertmanager runtime
        .route(
            "/alertmanager/api/v2/alerts",
            get(alertmanager::list_alerts).post(alertmanager::post_alerts),
        )
        .route("/alertmanager/api/v2/alerts/groups", get(alertmanager::alert_groups))
        .route("/alertmanager/api/v2/status", get(alertmanager::status))
        // Silences
        .route(
            "/alertmanager/api/v2/silences",
            get(silences::list_silences).post(silences::post_silence),
        )
        .route(
            "/alertmanager/api/v2/silence/{id}",
            get(silences::get_silence).delete(silences::delete_silence),
        )
        // Provisioning
        .route(
            "/v1/provisioning/policies",
            get(provisioning::get_policies)
                .put(provisioning::put_policies)
                .delete(provisioning::reset_policies),
        )
        .route(
            "/v1/provisioning/contact-points",
            get(provisioning::list_contact_points).post(provisioning::create_contact_point),
        )
        .route(
            "/v1/provisioning/contact-points/{uid}",
            put(provisioning::update_contact_point).delete(provisioning::delete_contact_point),
        )
        .route("/v1/provisioning/templates", get(provisioning::list_templates))
        .route(
            "/v1/provisioning/templates/{name}",
            get(provisioning::get_template)
                .put(provisioning::put_template)
                .delete(provisioning::delete_template),
        )
        .route(
            "/v1/provisioning/mute-timings",
            get(provisioning::list_mute_timings).post(provisioning::create_mute_timing),
        )
        .route(
            "/v1/provisioning/mute-timings/{name}",
            get(provisioning::get_mute_timing)
                .put(provisioning::update_mute_timing)
                .delete(provisioning::delete_mute_timing),
        )
        // Admin configuration
        .route(
            "/v1/ngalert/admin_config",
            get(admin::get_admin_config)
                .post(admin::post_admin_config)
                .delete(admin::delete_admin_config),
        )
        .route("/v1/ngalert/alertmanagers", get(admin::alertmanagers));

    Router::new()
        .nest("/api", api_routes)
        .route("/metrics", get(health::metrics))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Build the CORS layer from the allowed origins; none allows any.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
