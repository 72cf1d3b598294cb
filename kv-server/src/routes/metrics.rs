//! Metrics and status routes.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::routes::AppState;

pub async fn json(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "ops": state.kv.metrics.snapshot() })))
}

/// Prometheus text exposition: per-op counters plus storage and queue
/// gauges derived from the engine status.
pub async fn prometheus(State(state): State<AppState>) -> ApiResult<String> {
    let status = state.kv.status()?;
    let gauges: Vec<(&str, f64)> = vec![
        ("kv_entries_total", status.keys as f64),
        ("kv_entries_bytes", status.size as f64),
        ("kv_queue_pending", status.queue_pending as f64),
        ("kv_queue_processing", status.queue_processing as f64),
        ("kv_dlq_total", status.dlq as f64),
    ];
    Ok(state.kv.metrics.to_prometheus(&gauges))
}

pub async fn status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.kv.status()?)))
}
