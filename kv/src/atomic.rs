//! Atomic operations: versionstamp checks plus buffered mutations committed
//! in one row-store transaction under optimistic concurrency control.
//!
//! Mutations are a tagged sum type and the committer is a switch over the
//! tag. All mutations of one commit share a single versionstamp; triggers
//! fire only after the transaction is durable, in build order. A failed
//! check is a normal negative outcome (`ok: false`) with no side effects.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use crate::codec::key::{display_key, encode_key, Key, KeyPart};
use crate::codec::value::coerce_i64;
use crate::error::{CResult, Error};
use crate::store::engine::{apply_delete_exact, apply_set};
use crate::store::{now_s, ttl_deadline, CommitResult, Kv};
use crate::trigger::{ChangeEvent, EventKind};

/// Reserved text part replaced by the commit's versionstamp in mutation
/// keys. Lets callers build secondary indexes keyed by commit stamp.
pub const VERSIONSTAMP_PLACEHOLDER: &str = "\u{0}versionstamp\u{0}";

/// A version check: the key must currently carry `versionstamp` (`None`
/// requires absence) for the commit to proceed.
#[derive(Clone, Debug)]
pub struct Check {
    pub key: Key,
    pub versionstamp: Option<String>,
}

/// One buffered mutation.
#[derive(Clone, Debug)]
pub enum Mutation {
    Set { key: Key, value: Value, expire_in_ms: Option<u64> },
    /// Exact-key delete. Distinct from the engine's top-level tree delete.
    Delete { key: Key },
    /// 64-bit signed sum with two's-complement wraparound. Absent keys
    /// count as 0.
    Sum { key: Key, value: Value },
    /// Signed 64-bit maximum. Absent keys take the operand.
    Max { key: Key, value: Value },
    /// Signed 64-bit minimum. Absent keys take the operand.
    Min { key: Key, value: Value },
    /// Array concatenation after the current value.
    Append { key: Key, value: Value },
    /// Array concatenation before the current value.
    Prepend { key: Key, value: Value },
}

impl Mutation {
    fn key(&self) -> &Key {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Delete { key }
            | Mutation::Sum { key, .. }
            | Mutation::Max { key, .. }
            | Mutation::Min { key, .. }
            | Mutation::Append { key, .. }
            | Mutation::Prepend { key, .. } => key,
        }
    }
}

/// Builder collecting checks and mutations for one commit.
pub struct AtomicOp<'a> {
    kv: &'a Kv,
    checks: Vec<Check>,
    mutations: Vec<Mutation>,
}

impl Kv {
    /// Starts a new atomic operation.
    pub fn atomic(&self) -> AtomicOp<'_> {
        AtomicOp { kv: self, checks: Vec::new(), mutations: Vec::new() }
    }
}

impl<'a> AtomicOp<'a> {
    pub fn check(mut self, key: Key, versionstamp: Option<String>) -> Self {
        self.checks.push(Check { key, versionstamp });
        self
    }

    pub fn set(mut self, key: Key, value: Value) -> Self {
        self.mutations.push(Mutation::Set { key, value, expire_in_ms: None });
        self
    }

    pub fn set_with_ttl(mut self, key: Key, value: Value, expire_in_ms: u64) -> Self {
        self.mutations
            .push(Mutation::Set { key, value, expire_in_ms: Some(expire_in_ms) });
        self
    }

    pub fn delete(mut self, key: Key) -> Self {
        self.mutations.push(Mutation::Delete { key });
        self
    }

    pub fn sum(mut self, key: Key, operand: Value) -> Self {
        self.mutations.push(Mutation::Sum { key, value: operand });
        self
    }

    pub fn max(mut self, key: Key, operand: Value) -> Self {
        self.mutations.push(Mutation::Max { key, value: operand });
        self
    }

    pub fn min(mut self, key: Key, operand: Value) -> Self {
        self.mutations.push(Mutation::Min { key, value: operand });
        self
    }

    pub fn append(mut self, key: Key, operand: Value) -> Self {
        self.mutations.push(Mutation::Append { key, value: operand });
        self
    }

    pub fn prepend(mut self, key: Key, operand: Value) -> Self {
        self.mutations.push(Mutation::Prepend { key, value: operand });
        self
    }

    /// Adds an already-built mutation (the wire surface deserializes into
    /// [`Mutation`] directly).
    pub fn mutate(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    /// Runs the commit protocol. `ok: false` means a check failed and
    /// nothing was written; storage faults propagate with no partial state.
    pub fn commit(self) -> CResult<CommitResult> {
        let AtomicOp { kv, checks, mutations } = self;
        let result = kv.metrics.observe("atomic", || {
            let mut conn = kv.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // Phase 1: verify every check under the write lock.
            for check in &checks {
                let key_bytes = encode_key(&check.key)?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT versionstamp FROM kv_entries \
                         WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                        params![key_bytes, now_s()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if current != check.versionstamp {
                    return Ok(None);
                }
            }

            // Phase 2: one shared stamp for the whole commit.
            let versionstamp = kv.next_versionstamp();

            // Phase 3: apply mutations in build order.
            let mut events: Vec<(ChangeEvent, Vec<u8>)> = Vec::with_capacity(mutations.len());
            for mutation in &mutations {
                let key = resolve_placeholders(mutation.key(), &versionstamp);
                let key_bytes = encode_key(&key)?;
                if key.is_empty() {
                    return Err(Error::InvalidArgument(
                        "empty key is only valid as a prefix".into(),
                    ));
                }
                match mutation {
                    Mutation::Set { value, expire_in_ms, .. } => {
                        let expires_at = expire_in_ms.map(ttl_deadline);
                        apply_set(&tx, &kv.fts, &key_bytes, value, &versionstamp, expires_at)?;
                        events.push((
                            ChangeEvent {
                                kind: EventKind::Set,
                                key,
                                value: Some(value.clone()),
                                versionstamp: Some(versionstamp.clone()),
                            },
                            key_bytes,
                        ));
                    }
                    Mutation::Delete { .. } => {
                        apply_delete_exact(&tx, &kv.fts, &key_bytes)?;
                        events.push((
                            ChangeEvent {
                                kind: EventKind::Delete,
                                key,
                                value: None,
                                versionstamp: None,
                            },
                            key_bytes,
                        ));
                    }
                    Mutation::Sum { value, .. }
                    | Mutation::Max { value, .. }
                    | Mutation::Min { value, .. } => {
                        let operand = coerce_i64(value)?;
                        let current = read_current_i64(&tx, &key_bytes, &key)?;
                        let next = match mutation {
                            Mutation::Sum { .. } => current.unwrap_or(0).wrapping_add(operand),
                            Mutation::Max { .. } => current.map_or(operand, |c| c.max(operand)),
                            _ => current.map_or(operand, |c| c.min(operand)),
                        };
                        let new_value = Value::from(next);
                        apply_set(&tx, &kv.fts, &key_bytes, &new_value, &versionstamp, None)?;
                        events.push((
                            ChangeEvent {
                                kind: EventKind::Set,
                                key,
                                value: Some(new_value),
                                versionstamp: Some(versionstamp.clone()),
                            },
                            key_bytes,
                        ));
                    }
                    Mutation::Append { value, .. } | Mutation::Prepend { value, .. } => {
                        let operand = value.as_array().cloned().ok_or_else(|| {
                            Error::InvalidArgument(format!(
                                "append/prepend operand on {} must be an array",
                                display_key(&key)
                            ))
                        })?;
                        let current = read_current_array(&tx, &key_bytes, &key)?;
                        let combined = match mutation {
                            Mutation::Append { .. } => {
                                let mut out = current;
                                out.extend(operand);
                                out
                            }
                            _ => {
                                let mut out = operand;
                                out.extend(current);
                                out
                            }
                        };
                        let new_value = Value::Array(combined);
                        apply_set(&tx, &kv.fts, &key_bytes, &new_value, &versionstamp, None)?;
                        events.push((
                            ChangeEvent {
                                kind: EventKind::Set,
                                key,
                                value: Some(new_value),
                                versionstamp: Some(versionstamp.clone()),
                            },
                            key_bytes,
                        ));
                    }
                }
            }

            tx.commit()?;
            Ok(Some((versionstamp, events)))
        })?;

        // Phase 4: triggers, after the commit is durable, in build order.
        match result {
            Some((versionstamp, events)) => {
                for (event, key_bytes) in &events {
                    kv.triggers.dispatch(event, key_bytes);
                }
                Ok(CommitResult::committed(versionstamp))
            }
            None => Ok(CommitResult::conflict()),
        }
    }
}

/// Replaces the reserved placeholder in text parts with the commit stamp.
fn resolve_placeholders(key: &Key, versionstamp: &str) -> Key {
    key.iter()
        .map(|part| match part {
            KeyPart::Text(s) if s == VERSIONSTAMP_PLACEHOLDER => {
                KeyPart::Text(versionstamp.to_string())
            }
            other => other.clone(),
        })
        .collect()
}

fn read_current_value(
    tx: &rusqlite::Transaction,
    key_bytes: &[u8],
) -> CResult<Option<Value>> {
    let text: Option<String> = tx
        .query_row(
            "SELECT value FROM kv_entries \
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key_bytes, now_s()],
            |row| row.get(0),
        )
        .optional()?;
    match text {
        Some(text) => Ok(Some(crate::codec::value::deserialize_value(text.as_bytes())?)),
        None => Ok(None),
    }
}

fn read_current_i64(
    tx: &rusqlite::Transaction,
    key_bytes: &[u8],
    key: &Key,
) -> CResult<Option<i64>> {
    match read_current_value(tx, key_bytes)? {
        None => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "current value at {} is not a 64-bit integer",
                    display_key(key)
                ))
            }),
    }
}

fn read_current_array(
    tx: &rusqlite::Transaction,
    key_bytes: &[u8],
    key: &Key,
) -> CResult<Vec<Value>> {
    match read_current_value(tx, key_bytes)? {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(Error::InvalidArgument(format!(
            "current value at {} is not an array",
            display_key(key)
        ))),
    }
}
