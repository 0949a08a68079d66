use super::AppState;
use crate::collectors::metric::render;
use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{error, info, warn};

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let report = state.server.scrape().await;
    if !report.failures.is_empty() {
        warn!(failed = report.failures.len(), "scrape finished with failed query groups");
    }

    state.exporter.collect();

    let mut families = render(&report.metrics).gather();
    families.extend(state.registry.gather());

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("failed to encode metrics: {e}");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.server.ping().await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            warn!("health check failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

pub async fn reload(State(state): State<Arc<AppState>>) -> Response {
    match state.options.load_instances() {
        Ok(instances) => {
            let groups = instances.len();
            state.server.instances().replace(instances);
            state.server.invalidate_cache();
            info!(groups, "reloaded query groups");
            (StatusCode::OK, format!("reloaded {groups} query groups\n")).into_response()
        }
        Err(e) => {
            error!("reload failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}\n")).into_response()
        }
    }
}
