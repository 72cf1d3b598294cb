//! Order-preserving binary encoding of composite keys.
//!
//! A key is a sequence of parts. Each encoded part starts with a one-byte
//! type tag whose numeric value fixes the order between types
//! (bytes < text < number < big integer < boolean), and parts are joined by
//! a reserved separator byte. Within a type the payload encoding is chosen
//! so that byte order equals semantic order, which lets the row store answer
//! range scans over the raw `BLOB` primary key.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use num_bigint::{BigInt, Sign};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{CResult, Error};

/// Separator between encoded parts. Escaped inside variable-length payloads.
pub const SEP: u8 = 0x00;
/// Escape byte for separator/escape occurrences inside variable payloads.
pub const ESC: u8 = 0x01;
/// Upper fence used by prefix ranges; no encoded key byte at a part boundary
/// ever reaches it.
pub const RANGE_END: u8 = 0xFF;

const TAG_BYTES: u8 = 0x10;
const TAG_TEXT: u8 = 0x20;
const TAG_NUMBER: u8 = 0x30;
const TAG_BIGINT_NEG: u8 = 0x40;
const TAG_BIGINT_POS: u8 = 0x41;
const TAG_FALSE: u8 = 0x50;
const TAG_TRUE: u8 = 0x51;

/// A single component of a composite key.
#[derive(Clone, Debug, PartialEq)]
pub enum KeyPart {
    Bytes(Vec<u8>),
    Text(String),
    Number(f64),
    BigInt(BigInt),
    Bool(bool),
}

/// A composite key. Empty is allowed only as a universal prefix, never as a
/// stored key; the engine enforces that.
pub type Key = Vec<KeyPart>;

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            KeyPart::Text(s) => write!(f, "{:?}", s),
            KeyPart::Number(n) => write!(f, "{}", n),
            KeyPart::BigInt(n) => write!(f, "{}n", n),
            KeyPart::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Renders a key as `["user", 42]` for error messages and logs.
pub fn display_key(key: &[KeyPart]) -> String {
    let parts: Vec<String> = key.iter().map(|p| p.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

impl KeyPart {
    /// Converts the JSON wire representation of a key part. Strings, finite
    /// numbers and booleans map directly; byte strings and big integers use
    /// the `__type` envelope.
    pub fn from_json(value: &Value) -> CResult<KeyPart> {
        match value {
            Value::String(s) => Ok(KeyPart::Text(s.clone())),
            Value::Number(n) => {
                let f = n
                    .as_f64()
                    .ok_or_else(|| Error::InvalidArgument(format!("unrepresentable number {}", n)))?;
                Ok(KeyPart::Number(f))
            }
            Value::Bool(b) => Ok(KeyPart::Bool(*b)),
            Value::Object(map) => match map.get("__type").and_then(Value::as_str) {
                Some("bigint") => {
                    let digits = map
                        .get("value")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::InvalidArgument("bigint part without value".into()))?;
                    let n = digits
                        .parse::<BigInt>()
                        .map_err(|_| Error::InvalidArgument(format!("bad bigint {:?}", digits)))?;
                    Ok(KeyPart::BigInt(n))
                }
                Some("bytes") => {
                    let b64 = map
                        .get("value")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::InvalidArgument("bytes part without value".into()))?;
                    use base64::Engine as _;
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .map_err(|e| Error::InvalidArgument(format!("bad base64 bytes: {}", e)))?;
                    Ok(KeyPart::Bytes(bytes))
                }
                other => Err(Error::InvalidArgument(format!(
                    "invalid-key-part: unsupported object part {:?}",
                    other
                ))),
            },
            other => Err(Error::InvalidArgument(format!(
                "invalid-key-part: {} is not a key part",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyPart::Text(s) => Value::String(s.clone()),
            KeyPart::Number(n) => serde_json::json!(n),
            KeyPart::Bool(b) => Value::Bool(*b),
            KeyPart::BigInt(n) => {
                serde_json::json!({"__type": "bigint", "value": n.to_string()})
            }
            KeyPart::Bytes(b) => {
                use base64::Engine as _;
                let b64 = base64::engine::general_purpose::STANDARD.encode(b);
                serde_json::json!({"__type": "bytes", "value": b64})
            }
        }
    }
}

impl Serialize for KeyPart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyPart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        KeyPart::from_json(&value).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// Converts a JSON array into a key.
pub fn key_from_json(value: &Value) -> CResult<Key> {
    let parts = value
        .as_array()
        .ok_or_else(|| Error::InvalidArgument("key must be an array of parts".into()))?;
    parts.iter().map(KeyPart::from_json).collect()
}

/// Appends `data` with separator and escape occurrences escaped, preserving
/// byte order: 0x00 -> 0x01 0x01, 0x01 -> 0x01 0x02.
fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        match b {
            SEP => out.extend_from_slice(&[ESC, 0x01]),
            ESC => out.extend_from_slice(&[ESC, 0x02]),
            _ => out.push(b),
        }
    }
}

/// Encodes an f64 so that the byte order of the result matches numeric order:
/// sign bit flipped for non-negatives, all bits flipped for negatives.
fn encode_f64(n: f64) -> CResult<[u8; 8]> {
    if !n.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "invalid-key-part: non-finite number {}",
            n
        )));
    }
    // -0.0 and 0.0 must encode identically or ordering becomes ambiguous.
    let n = if n == 0.0 { 0.0 } else { n };
    let bits = n.to_bits();
    let ordered = if bits & (1 << 63) == 0 { bits ^ (1 << 63) } else { !bits };
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, ordered);
    Ok(buf)
}

fn decode_f64(buf: &[u8]) -> f64 {
    let ordered = BigEndian::read_u64(buf);
    let bits = if ordered & (1 << 63) != 0 { ordered ^ (1 << 63) } else { !ordered };
    f64::from_bits(bits)
}

fn encode_part(part: &KeyPart, out: &mut Vec<u8>) -> CResult<()> {
    match part {
        KeyPart::Bytes(b) => {
            out.push(TAG_BYTES);
            escape_into(b, out);
        }
        KeyPart::Text(s) => {
            out.push(TAG_TEXT);
            escape_into(s.as_bytes(), out);
        }
        KeyPart::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(*n)?);
        }
        KeyPart::BigInt(n) => {
            let (sign, magnitude) = n.to_bytes_be();
            if magnitude.len() > u32::MAX as usize {
                return Err(Error::InvalidArgument("invalid-key-part: bigint too large".into()));
            }
            let mut len = [0u8; 4];
            BigEndian::write_u32(&mut len, magnitude.len() as u32);
            if sign == Sign::Minus {
                // Complemented length and magnitude: more negative sorts first.
                out.push(TAG_BIGINT_NEG);
                out.extend(len.iter().map(|b| !b));
                out.extend(magnitude.iter().map(|b| !b));
            } else {
                out.push(TAG_BIGINT_POS);
                out.extend_from_slice(&len);
                out.extend_from_slice(&magnitude);
            }
        }
        KeyPart::Bool(b) => {
            out.push(if *b { TAG_TRUE } else { TAG_FALSE });
        }
    }
    Ok(())
}

/// Encodes a key. The empty key encodes to the empty byte string.
pub fn encode_key(key: &[KeyPart]) -> CResult<Vec<u8>> {
    let mut out = Vec::with_capacity(key.len() * 9);
    for (i, part) in key.iter().enumerate() {
        if i > 0 {
            out.push(SEP);
        }
        encode_part(part, &mut out)?;
    }
    Ok(out)
}

/// Decodes an encoded key. Fails with `CorruptKey` on malformed bytes.
pub fn decode_key(bytes: &[u8]) -> CResult<Key> {
    let mut parts = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let tag = bytes[pos];
        pos += 1;
        let part = match tag {
            TAG_BYTES | TAG_TEXT => {
                let mut payload = Vec::new();
                while pos < bytes.len() && bytes[pos] != SEP {
                    match bytes[pos] {
                        ESC => {
                            pos += 1;
                            match bytes.get(pos).copied() {
                                Some(0x01) => payload.push(SEP),
                                Some(0x02) => payload.push(ESC),
                                other => {
                                    return Err(Error::CorruptKey(format!(
                                        "bad escape {:?} at offset {}",
                                        other, pos
                                    )))
                                }
                            }
                        }
                        b => payload.push(b),
                    }
                    pos += 1;
                }
                if tag == TAG_BYTES {
                    KeyPart::Bytes(payload)
                } else {
                    let text = String::from_utf8(payload)
                        .map_err(|e| Error::CorruptKey(format!("invalid utf-8: {}", e)))?;
                    KeyPart::Text(text)
                }
            }
            TAG_NUMBER => {
                let end = pos + 8;
                if end > bytes.len() {
                    return Err(Error::CorruptKey("truncated number part".into()));
                }
                let n = decode_f64(&bytes[pos..end]);
                pos = end;
                KeyPart::Number(n)
            }
            TAG_BIGINT_NEG | TAG_BIGINT_POS => {
                if pos + 4 > bytes.len() {
                    return Err(Error::CorruptKey("truncated bigint length".into()));
                }
                let negative = tag == TAG_BIGINT_NEG;
                let mut len_buf = [0u8; 4];
                len_buf.copy_from_slice(&bytes[pos..pos + 4]);
                if negative {
                    for b in len_buf.iter_mut() {
                        *b = !*b;
                    }
                }
                let len = BigEndian::read_u32(&len_buf) as usize;
                pos += 4;
                let end = pos + len;
                if end > bytes.len() {
                    return Err(Error::CorruptKey("truncated bigint magnitude".into()));
                }
                let magnitude: Vec<u8> = if negative {
                    bytes[pos..end].iter().map(|b| !b).collect()
                } else {
                    bytes[pos..end].to_vec()
                };
                pos = end;
                let sign = if negative { Sign::Minus } else { Sign::Plus };
                KeyPart::BigInt(BigInt::from_bytes_be(sign, &magnitude))
            }
            TAG_FALSE => KeyPart::Bool(false),
            TAG_TRUE => KeyPart::Bool(true),
            other => return Err(Error::CorruptKey(format!("unknown tag {:#04x}", other))),
        };
        parts.push(part);
        if pos < bytes.len() {
            if bytes[pos] != SEP {
                return Err(Error::CorruptKey(format!(
                    "expected separator at offset {}, got {:#04x}",
                    pos, bytes[pos]
                )));
            }
            pos += 1;
            if pos == bytes.len() {
                return Err(Error::CorruptKey("trailing separator".into()));
            }
        }
    }
    Ok(parts)
}

/// Computes `[start, end)` covering every key that strictly extends `prefix`.
/// The entry stored at the exact prefix key itself is NOT in this range;
/// callers that want it match `encode_key(prefix)` separately.
pub fn prefix_range(prefix: &[KeyPart]) -> CResult<(Vec<u8>, Vec<u8>)> {
    let encoded = encode_key(prefix)?;
    let mut start = encoded.clone();
    start.push(SEP);
    let mut end = encoded;
    end.push(RANGE_END);
    Ok((start, end))
}
