//! Watch routes: SSE change streams over key sets and prefixes, plus a
//! stateless one-shot poll endpoint.
//!
//! The SSE generators poll the store on a fixed interval, emit `change`
//! events only when a versionstamp moved, and keep idle connections alive
//! with `ping` events. Client disconnects drop the stream at the next await
//! point; in-flight polls finish naturally.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::Stream;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use tidekv::watch;

use crate::error::ApiResult;
use crate::path::{parse_key_list, parse_prefix};
use crate::routes::AppState;

/// Idle time before a `ping` keeps the connection alive.
const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    pub keys: String,
    pub initial: Option<bool>,
}

pub async fn watch_keys_sse(
    State(state): State<AppState>,
    Query(query): Query<WatchQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let keys = parse_key_list(&query.keys)?;
    let emit_initial = query.initial.unwrap_or(false);
    let poll_every = Duration::from_millis(state.cfg.watch_poll_ms());
    let kv = state.kv.clone();

    let stream = async_stream::stream! {
        // Without `initial`, prime the stamps so connecting is silent.
        let mut known: Vec<Option<String>> = if emit_initial {
            Vec::new()
        } else {
            match watch::poll_keys(&kv, &keys, &[]) {
                Ok(delta) => delta.stamps,
                Err(err) => {
                    yield Ok(Event::default().event("error").data(err.to_string()));
                    return;
                }
            }
        };
        let mut last_emit = Instant::now();
        loop {
            match watch::poll_keys(&kv, &keys, &known) {
                Ok(delta) => {
                    known = delta.stamps;
                    if !delta.changed.is_empty() {
                        let payload = json!({ "entries": delta.changed }).to_string();
                        yield Ok(Event::default().event("change").data(payload));
                        last_emit = Instant::now();
                    } else if last_emit.elapsed() >= PING_INTERVAL {
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
    Ok(Sse::new(stream))
}

#[derive(Debug, Deserialize)]
pub struct WatchPollQuery {
    pub keys: String,
    pub versionstamps: Option<String>,
}

/// One-shot delta poll: the client supplies its last known stamps and gets
/// back only what changed, plus the full new stamp vector. No server state.
pub async fn watch_keys_poll(
    State(state): State<AppState>,
    Query(query): Query<WatchPollQuery>,
) -> ApiResult<Json<Value>> {
    let keys = parse_key_list(&query.keys)?;
    let known: Vec<Option<String>> = query
        .versionstamps
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(|s| {
            let s = s.trim();
            if s.is_empty() || s == "null" {
                None
            } else {
                Some(s.to_string())
            }
        })
        .collect();
    let delta = watch::poll_keys(&state.kv, &keys, &known)?;
    Ok(Json(json!({
        "entries": delta.changed,
        "versionstamps": delta.stamps,
    })))
}

#[derive(Debug, Deserialize)]
pub struct WatchPrefixQuery {
    pub prefix: Option<String>,
    pub limit: Option<u32>,
}

pub async fn watch_prefix_sse(
    State(state): State<AppState>,
    Query(query): Query<WatchPrefixQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let prefix = parse_prefix(query.prefix.as_deref())?;
    let limit = query.limit;
    let poll_every = Duration::from_millis(state.cfg.watch_poll_ms());
    let kv = state.kv.clone();

    let stream = async_stream::stream! {
        let mut snapshot: BTreeMap<String, String> = BTreeMap::new();
        let mut last_emit = Instant::now();
        loop {
            match watch::poll_prefix(&kv, &prefix, limit, &snapshot) {
                Ok(delta) => {
                    snapshot = delta.snapshot;
                    if !delta.changed.is_empty() {
                        let payload = json!({ "entries": delta.changed }).to_string();
                        yield Ok(Event::default().event("change").data(payload));
                        last_emit = Instant::now();
                    } else if last_emit.elapsed() >= PING_INTERVAL {
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
    Ok(Sse::new(stream))
}
