//! Path- and JSON-encoded key parsing with the wire limits: max depth 20,
//! max part length 1024, max batch size 1000. Violations are 400s whose
//! message names the offending index.

use serde_json::Value;
use tidekv::codec::{Key, KeyPart};

use crate::error::{bad_request, ApiError};

pub const MAX_KEY_DEPTH: usize = 20;
pub const MAX_PART_LEN: usize = 1024;
pub const MAX_BATCH: usize = 1000;

/// Largest integer that survives an f64 round trip.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Parses a `/`-separated key path. Parts matching `^-?\d+$` that fit a safe
/// integer coerce to numbers; everything else stays text.
pub fn parse_key_path(path: &str) -> Result<Key, ApiError> {
    let raw: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if raw.len() > MAX_KEY_DEPTH {
        return Err(bad_request(format!(
            "key depth {} exceeds the maximum of {}",
            raw.len(),
            MAX_KEY_DEPTH
        )));
    }
    let mut key = Vec::with_capacity(raw.len());
    for (i, part) in raw.iter().enumerate() {
        if part.len() > MAX_PART_LEN {
            return Err(bad_request(format!(
                "key part {} is {} chars, maximum is {}",
                i,
                part.len(),
                MAX_PART_LEN
            )));
        }
        key.push(coerce_part(part));
    }
    Ok(key)
}

fn coerce_part(part: &str) -> KeyPart {
    let numeric = {
        let digits = part.strip_prefix('-').unwrap_or(part);
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
    };
    if numeric {
        if let Ok(n) = part.parse::<i64>() {
            if n.abs() <= MAX_SAFE_INTEGER {
                return KeyPart::Number(n as f64);
            }
        }
    }
    KeyPart::Text(part.to_string())
}

/// Parses a comma-separated list of key paths (the watch endpoints).
pub fn parse_key_list(csv: &str) -> Result<Vec<Key>, ApiError> {
    let keys: Vec<&str> = csv.split(',').filter(|p| !p.is_empty()).collect();
    if keys.len() > MAX_BATCH {
        return Err(bad_request(format!(
            "{} keys exceed the batch maximum of {}",
            keys.len(),
            MAX_BATCH
        )));
    }
    keys.iter().map(|path| parse_key_path(path)).collect()
}

/// Converts a JSON key (array of parts) applying the same limits. `label`
/// names the key in error messages (e.g. its index in a batch).
pub fn key_from_json_checked(value: &Value, label: &str) -> Result<Key, ApiError> {
    let key = tidekv::codec::key_from_json(value).map_err(ApiError)?;
    if key.len() > MAX_KEY_DEPTH {
        return Err(bad_request(format!(
            "key {}: depth {} exceeds the maximum of {}",
            label,
            key.len(),
            MAX_KEY_DEPTH
        )));
    }
    for (i, part) in key.iter().enumerate() {
        let len = match part {
            KeyPart::Text(s) => s.len(),
            KeyPart::Bytes(b) => b.len(),
            _ => 0,
        };
        if len > MAX_PART_LEN {
            return Err(bad_request(format!(
                "key {}: part {} is {} bytes, maximum is {}",
                label, i, len, MAX_PART_LEN
            )));
        }
    }
    Ok(key)
}

/// Parses an optional `prefix` query parameter; absent means the root.
pub fn parse_prefix(prefix: Option<&str>) -> Result<Key, ApiError> {
    match prefix {
        Some(path) if !path.is_empty() => parse_key_path(path),
        _ => Ok(Vec::new()),
    }
}
