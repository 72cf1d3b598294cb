//! Queue routes: enqueue, SSE listen, one-shot poll, ack/nack, stats, and
//! the DLQ management surface.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::Json;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use tidekv::queue::EnqueueOptions;

use crate::error::ApiResult;
use crate::path::key_from_json_checked;
use crate::routes::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptionsBody {
    pub delay: Option<u64>,
    pub backoff_schedule: Option<Vec<u64>>,
    #[serde(default)]
    pub keys_if_undelivered: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub value: Value,
    #[serde(default)]
    pub options: EnqueueOptionsBody,
}

pub async fn enqueue(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<Json<Value>> {
    let mut fallback_keys = Vec::with_capacity(body.options.keys_if_undelivered.len());
    for (i, raw) in body.options.keys_if_undelivered.iter().enumerate() {
        fallback_keys.push(key_from_json_checked(raw, &format!("keysIfUndelivered {}", i))?);
    }
    let id = state.kv.enqueue(
        &body.value,
        EnqueueOptions {
            delay_ms: body.options.delay.unwrap_or(0),
            backoff_schedule: body.options.backoff_schedule,
            keys_if_undelivered: fallback_keys,
        },
    )?;
    Ok(Json(json!({ "id": id })))
}

/// SSE stream of dequeued messages. Each message is leased to this consumer;
/// acks and nacks arrive over the POST endpoints.
pub async fn listen_sse(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let kv = state.kv.clone();
    let poll_every = Duration::from_millis(state.cfg.queue_poll_ms());

    let stream = async_stream::stream! {
        let mut last_emit = Instant::now();
        loop {
            match kv.dequeue() {
                Ok(Some(message)) => {
                    let payload = json!(message).to_string();
                    yield Ok(Event::default().event("message").data(payload));
                    last_emit = Instant::now();
                    // Drain eagerly; only idle loops sleep.
                    continue;
                }
                Ok(None) => {
                    if last_emit.elapsed() >= PING_INTERVAL {
                        yield Ok(Event::default().event("ping").data("{}"));
                        last_emit = Instant::now();
                    }
                }
                Err(err) => {
                    yield Ok(Event::default().event("error").data(err.to_string()));
                    return;
                }
            }
            tokio::time::sleep(poll_every).await;
        }
    };
    Sse::new(stream)
}

/// One-shot dequeue; `null` when nothing is ready.
pub async fn poll(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let message = state.kv.dequeue()?;
    Ok(Json(json!({ "message": message })))
}

#[derive(Debug, Deserialize)]
pub struct IdBody {
    pub id: String,
}

pub async fn ack(
    State(state): State<AppState>,
    Json(body): Json<IdBody>,
) -> ApiResult<Json<Value>> {
    let acked = state.kv.ack(&body.id)?;
    Ok(Json(json!({ "acked": acked })))
}

pub async fn nack(
    State(state): State<AppState>,
    Json(body): Json<IdBody>,
) -> ApiResult<Json<Value>> {
    let result = state.kv.nack(&body.id)?;
    Ok(Json(json!({ "result": result })))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.kv.queue_stats()?)))
}

#[derive(Debug, Deserialize)]
pub struct DlqListQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

pub async fn dlq_list(
    State(state): State<AppState>,
    Query(query): Query<DlqListQuery>,
) -> ApiResult<Json<Value>> {
    let page = state.kv.dlq_list(query.cursor.as_deref(), query.limit)?;
    Ok(Json(json!(page)))
}

pub async fn dlq_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.kv.dlq_get(&id)?)))
}

pub async fn dlq_requeue(
    State(state): State<AppState>,
    Json(body): Json<IdBody>,
) -> ApiResult<Json<Value>> {
    let id = state.kv.dlq_requeue(&body.id)?;
    Ok(Json(json!({ "id": id })))
}

pub async fn dlq_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.kv.dlq_delete(&id)?;
    Ok(Json(json!({ "deleted": true })))
}

pub async fn dlq_purge(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let purged = state.kv.dlq_purge()?;
    Ok(Json(json!({ "purged": purged })))
}
