//! FTS catalog management and search routes.

use axum::extract::{Query, State};
use axum::Json;
use serde_derive::Deserialize;
use serde_json::{json, Value};

use crate::error::{bad_request, ApiResult};
use crate::path::{key_from_json_checked, parse_prefix};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateIndexBody {
    pub prefix: Value,
    pub fields: Vec<String>,
    pub tokenizer: Option<String>,
}

pub async fn create_index(
    State(state): State<AppState>,
    Json(body): Json<CreateIndexBody>,
) -> ApiResult<Json<Value>> {
    let prefix = key_from_json_checked(&body.prefix, "prefix")?;
    if prefix.is_empty() {
        return Err(bad_request("index prefix must not be empty"));
    }
    let info = state
        .kv
        .create_index(&prefix, &body.fields, body.tokenizer.as_deref())?;
    Ok(Json(json!(info)))
}

pub async fn list_indexes(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "indexes": state.kv.list_indexes()? })))
}

#[derive(Debug, Deserialize)]
pub struct DropIndexQuery {
    pub prefix: Option<String>,
}

pub async fn drop_index(
    State(state): State<AppState>,
    Query(query): Query<DropIndexQuery>,
) -> ApiResult<Json<Value>> {
    let prefix = parse_prefix(query.prefix.as_deref())?;
    if prefix.is_empty() {
        return Err(bad_request("index prefix must not be empty"));
    }
    state.kv.drop_index(&prefix)?;
    Ok(Json(json!({ "dropped": true })))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub prefix: Option<String>,
    pub q: String,
    pub limit: Option<u32>,
}

pub async fn search_get(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let prefix = parse_prefix(query.prefix.as_deref())?;
    let entries = state.kv.search(&prefix, &query.q, query.limit, None)?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub prefix: Value,
    pub query: String,
    pub limit: Option<u32>,
    pub r#where: Option<Value>,
}

pub async fn search_post(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> ApiResult<Json<Value>> {
    let prefix = key_from_json_checked(&body.prefix, "prefix")?;
    let entries = state
        .kv
        .search(&prefix, &body.query, body.limit, body.r#where.as_ref())?;
    Ok(Json(json!({ "entries": entries })))
}
