//! Value (de)serialization.
//!
//! Values are opaque JSON trees extended with arbitrary-precision integers.
//! Big integers travel in a reversible envelope so they survive JSON
//! serialization: `{"__type": "bigint", "value": "<decimal>"}`.

use num_bigint::BigInt;
use serde_json::{Map, Value};

use crate::error::{CResult, Error};

/// Wraps a big integer in its JSON envelope.
pub fn bigint(n: &BigInt) -> Value {
    let mut map = Map::new();
    map.insert("__type".into(), Value::String("bigint".into()));
    map.insert("value".into(), Value::String(n.to_string()));
    Value::Object(map)
}

/// Unwraps a bigint envelope, if `value` is one.
pub fn as_bigint(value: &Value) -> Option<BigInt> {
    let map = value.as_object()?;
    if map.get("__type")?.as_str()? != "bigint" {
        return None;
    }
    map.get("value")?.as_str()?.parse::<BigInt>().ok()
}

/// Serializes a value to the stored byte form (UTF-8 JSON).
pub fn serialize_value(value: &Value) -> CResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Parse(e.to_string()))
}

/// Deserializes stored bytes back into a value. Fails with `CorruptValue`
/// since these bytes were written by us.
pub fn deserialize_value(bytes: &[u8]) -> CResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| Error::CorruptValue(e.to_string()))
}

/// Coerces a numeric operand (JSON integer or bigint envelope) into the
/// fixed 64-bit signed width used by the atomic counters. Values outside
/// i64 are rejected rather than silently truncated.
pub fn coerce_i64(value: &Value) -> CResult<i64> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    if let Some(big) = as_bigint(value) {
        return i64::try_from(big)
            .map_err(|_| Error::InvalidArgument("operand exceeds 64-bit signed range".into()));
    }
    Err(Error::InvalidArgument(format!(
        "expected a 64-bit integer operand, got {}",
        value
    )))
}
