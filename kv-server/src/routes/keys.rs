//! Key-value routes: point ops, batch get, listing, counting, pagination.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use tidekv::error::Error;
use tidekv::store::{ListOptions, PaginateOptions, SetOptions};

use crate::error::{bad_request, ApiError, ApiResult};
use crate::path::{key_from_json_checked, parse_key_path, parse_prefix, MAX_BATCH};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutQuery {
    pub expire_in: Option<u64>,
}

pub async fn get_key(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Json<Value>> {
    let key = parse_key_path(&path)?;
    let entry = state.kv.get(&key)?;
    if !entry.exists() {
        return Err(ApiError(Error::NotFound(format!("key /{}", path))));
    }
    Ok(Json(json!(entry)))
}

pub async fn put_key(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<PutQuery>,
    Json(value): Json<Value>,
) -> ApiResult<Json<Value>> {
    let key = parse_key_path(&path)?;
    let result = state
        .kv
        .set(&key, &value, SetOptions { expire_in_ms: query.expire_in })?;
    Ok(Json(json!(result)))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteBody {
    pub r#where: Option<Value>,
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Option<Json<DeleteBody>>,
) -> ApiResult<Json<Value>> {
    let prefix = parse_key_path(&path)?;
    let r#where = body.and_then(|Json(b)| b.r#where);
    let deleted = state.kv.delete(&prefix, r#where.as_ref())?;
    Ok(Json(json!({ "deletedCount": deleted })))
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub keys: Vec<Value>,
}

pub async fn batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> ApiResult<Json<Value>> {
    if body.keys.len() > MAX_BATCH {
        return Err(bad_request(format!(
            "{} keys exceed the batch maximum of {}",
            body.keys.len(),
            MAX_BATCH
        )));
    }
    let mut keys = Vec::with_capacity(body.keys.len());
    for (i, raw) in body.keys.iter().enumerate() {
        keys.push(key_from_json_checked(raw, &i.to_string())?);
    }
    let entries = state.kv.get_many(&keys)?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<u32>,
    pub reverse: Option<bool>,
}

pub async fn list_get(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let prefix = parse_prefix(query.prefix.as_deref())?;
    let options = ListOptions {
        start: query.start.as_deref().map(parse_key_path).transpose()?,
        end: query.end.as_deref().map(parse_key_path).transpose()?,
        limit: query.limit,
        reverse: query.reverse.unwrap_or(false),
        r#where: None,
    };
    let entries = state.kv.list(&prefix, &options)?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
pub struct ListBody {
    pub prefix: Option<Value>,
    pub start: Option<Value>,
    pub end: Option<Value>,
    pub limit: Option<u32>,
    pub reverse: Option<bool>,
    pub r#where: Option<Value>,
}

pub async fn list_post(
    State(state): State<AppState>,
    Json(body): Json<ListBody>,
) -> ApiResult<Json<Value>> {
    let prefix = match &body.prefix {
        Some(raw) => key_from_json_checked(raw, "prefix")?,
        None => Vec::new(),
    };
    let options = ListOptions {
        start: body
            .start
            .as_ref()
            .map(|raw| key_from_json_checked(raw, "start"))
            .transpose()?,
        end: body
            .end
            .as_ref()
            .map(|raw| key_from_json_checked(raw, "end"))
            .transpose()?,
        limit: body.limit,
        reverse: body.reverse.unwrap_or(false),
        r#where: body.r#where,
    };
    let entries = state.kv.list(&prefix, &options)?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
pub struct PrefixQuery {
    pub prefix: Option<String>,
}

pub async fn count(
    State(state): State<AppState>,
    Query(query): Query<PrefixQuery>,
) -> ApiResult<Json<Value>> {
    let prefix = parse_prefix(query.prefix.as_deref())?;
    let count = state.kv.count(&prefix)?;
    Ok(Json(json!({ "count": count })))
}

#[derive(Debug, Deserialize)]
pub struct PaginateQuery {
    pub prefix: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    pub reverse: Option<bool>,
}

pub async fn paginate(
    State(state): State<AppState>,
    Query(query): Query<PaginateQuery>,
) -> ApiResult<Json<Value>> {
    let prefix = parse_prefix(query.prefix.as_deref())?;
    let page = state.kv.paginate(
        &prefix,
        &PaginateOptions {
            cursor: query.cursor,
            limit: query.limit,
            reverse: query.reverse.unwrap_or(false),
        },
    )?;
    Ok(Json(json!(page)))
}
