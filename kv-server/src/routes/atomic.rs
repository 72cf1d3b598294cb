//! The `/atomic` route: versionstamp checks plus mutations in one commit.

use axum::extract::State;
use axum::Json;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use tidekv::atomic::Mutation;
use tidekv::version::is_valid_versionstamp;

use crate::error::{bad_request, ApiResult};
use crate::path::key_from_json_checked;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckBody {
    pub key: Value,
    pub versionstamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationBody {
    pub r#type: String,
    pub key: Value,
    pub value: Option<Value>,
    pub expire_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AtomicBody {
    #[serde(default)]
    pub checks: Vec<CheckBody>,
    pub mutations: Vec<MutationBody>,
}

pub async fn commit(
    State(state): State<AppState>,
    Json(body): Json<AtomicBody>,
) -> ApiResult<Json<Value>> {
    let mut op = state.kv.atomic();

    for (i, check) in body.checks.iter().enumerate() {
        if let Some(stamp) = &check.versionstamp {
            if !is_valid_versionstamp(stamp) {
                return Err(bad_request(format!("check {}: malformed versionstamp", i)));
            }
        }
        let key = key_from_json_checked(&check.key, &format!("check {}", i))?;
        op = op.check(key, check.versionstamp.clone());
    }

    for (i, mutation) in body.mutations.iter().enumerate() {
        let label = format!("mutation {}", i);
        let key = key_from_json_checked(&mutation.key, &label)?;
        let value = || {
            mutation
                .value
                .clone()
                .ok_or_else(|| bad_request(format!("{}: `{}` needs a value", label, mutation.r#type)))
        };
        let built = match mutation.r#type.as_str() {
            "set" => Mutation::Set { key, value: value()?, expire_in_ms: mutation.expire_in },
            "delete" => Mutation::Delete { key },
            "sum" => Mutation::Sum { key, value: value()? },
            "max" => Mutation::Max { key, value: value()? },
            "min" => Mutation::Min { key, value: value()? },
            "append" => Mutation::Append { key, value: value()? },
            "prepend" => Mutation::Prepend { key, value: value()? },
            other => {
                return Err(bad_request(format!("{}: unknown mutation type `{}`", label, other)))
            }
        };
        op = op.mutate(built);
    }

    let result = op.commit()?;
    Ok(Json(json!(result)))
}
