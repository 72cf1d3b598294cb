//! Message-bus state propagation.
//!
//! Shared state travels as one HTTP header carrying a JSON object. A missing
//! or malformed header is treated as empty state; the malformed case is
//! logged once per process so a misbehaving client cannot flood the logs.

use std::sync::Once;

use http::header::HeaderMap;
use http::HeaderValue;
use log::warn;
use serde_json::{Map, Value};

/// The header carrying the serialized message-bus state on every
/// cross-boundary hop.
pub const MESSAGE_BUS_HEADER: &str = "x-message-bus-state";

static MALFORMED_LOGGED: Once = Once::new();

/// Reads the state object from `headers`. Missing or malformed input yields
/// an empty object.
pub fn state_from_headers(headers: &HeaderMap) -> Value {
    let Some(raw) = headers.get(MESSAGE_BUS_HEADER) else {
        return Value::Object(Map::new());
    };
    let parsed = raw
        .to_str()
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(text).ok())
        .filter(Value::is_object);
    match parsed {
        Some(state) => state,
        None => {
            MALFORMED_LOGGED.call_once(|| {
                warn!("malformed {} header, treating as empty state", MESSAGE_BUS_HEADER);
            });
            Value::Object(Map::new())
        }
    }
}

/// Writes (or overwrites) the state header.
pub fn apply_state_header(headers: &mut HeaderMap, state: &Value) {
    let serialized = state.to_string();
    if let Ok(value) = HeaderValue::from_str(&serialized) {
        headers.insert(MESSAGE_BUS_HEADER, value);
    } else {
        warn!("message-bus state not representable as a header, dropping");
    }
}

/// The inline script that seeds the client-side bus from the server state.
/// `<` is escaped so the JSON can never terminate the script element.
pub fn state_script(state: &Value) -> String {
    let json = state.to_string().replace('<', "\\u003c");
    format!(
        "<script>window.__PIERCING_MESSAGE_BUS_STATE__ = {};</script>",
        json
    )
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_header_is_empty_state() {
        let headers = HeaderMap::new();
        assert_eq!(state_from_headers(&headers), json!({}));
    }

    #[test]
    fn malformed_header_is_empty_state() {
        let mut headers = HeaderMap::new();
        headers.insert(MESSAGE_BUS_HEADER, HeaderValue::from_static("{not json"));
        assert_eq!(state_from_headers(&headers), json!({}));
        headers.insert(MESSAGE_BUS_HEADER, HeaderValue::from_static("[1,2]"));
        assert_eq!(state_from_headers(&headers), json!({}));
    }

    #[test]
    fn roundtrip_through_headers() {
        let state = json!({"user": {"id": 7}, "theme": "dark"});
        let mut headers = HeaderMap::new();
        apply_state_header(&mut headers, &state);
        assert_eq!(state_from_headers(&headers), state);
    }

    #[test]
    fn state_script_escapes_script_terminators() {
        let state = json!({"evil": "</script><script>alert(1)"});
        let script = state_script(&state);
        assert!(!script.contains("</script><script>alert"));
        assert!(script.starts_with("<script>window.__PIERCING_MESSAGE_BUS_STATE__ = "));
    }
}
