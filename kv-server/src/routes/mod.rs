//! HTTP surface assembly: one router over the engine, handler modules per
//! concern.

pub mod atomic;
pub mod keys;
pub mod metrics;
pub mod queue;
pub mod search;
pub mod watch;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tidekv::store::Kv;

use crate::config::ConfigLoad;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub kv: Kv,
    pub cfg: Arc<ConfigLoad>,
}

pub fn router(kv: Kv, cfg: Arc<ConfigLoad>) -> Router {
    let state = AppState { kv, cfg };
    Router::new()
        .route("/keys", get(keys::list_get))
        .route("/keys/batch", post(keys::batch))
        .route("/keys/list", post(keys::list_post))
        .route("/keys/count", get(keys::count))
        .route("/keys/paginate", get(keys::paginate))
        .route(
            "/keys/*path",
            get(keys::get_key).put(keys::put_key).delete(keys::delete_key),
        )
        .route("/atomic", post(atomic::commit))
        .route("/watch", get(watch::watch_keys_sse))
        .route("/watch/poll", get(watch::watch_keys_poll))
        .route("/watch/prefix", get(watch::watch_prefix_sse))
        .route("/queue/enqueue", post(queue::enqueue))
        .route("/queue/listen", get(queue::listen_sse))
        .route("/queue/poll", get(queue::poll))
        .route("/queue/ack", post(queue::ack))
        .route("/queue/nack", post(queue::nack))
        .route("/queue/stats", get(queue::stats))
        .route("/queue/dlq", get(queue::dlq_list).delete(queue::dlq_purge))
        .route("/queue/dlq/requeue", post(queue::dlq_requeue))
        .route(
            "/queue/dlq/:id",
            get(queue::dlq_get).delete(queue::dlq_delete),
        )
        .route(
            "/indexes",
            post(search::create_index).get(search::list_indexes).delete(search::drop_index),
        )
        .route("/search", get(search::search_get).post(search::search_post))
        .route("/metrics", get(metrics::json))
        .route("/metrics/prometheus", get(metrics::prometheus))
        .route("/status", get(metrics::status))
        .with_state(state)
}
