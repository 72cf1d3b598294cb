//! Reliable queue on the same transactional substrate as the KV.
//!
//! Messages are rows in `kv_queue`; the dequeue state change (pending →
//! processing plus a lock lease) happens in one write transaction, which is
//! what makes concurrent dequeuers see disjoint messages. Terminal failures
//! move the row to `kv_dlq` and, when configured, write the original value
//! to fallback keys as normal KV entries.

pub mod listener;

use base64::Engine as _;
use log::warn;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_derive::Serialize;
use serde_json::Value;

use crate::codec::key::{encode_key, key_from_json, Key};
use crate::error::{CResult, Error};
use crate::store::engine::{apply_set, clamp_limit};
use crate::store::{now_ms, Kv};
use crate::trigger::{ChangeEvent, EventKind};

/// Delivery backoff when the caller does not supply a schedule, ms.
pub const DEFAULT_BACKOFF_MS: &[u64] = &[1000, 5000, 10000];
/// How long a dequeued message stays locked to its consumer, ms.
pub const DEFAULT_LEASE_MS: u64 = 30_000;

/// Options for [`Kv::enqueue`].
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Delay before the message becomes ready, ms.
    pub delay_ms: u64,
    /// Retry backoff schedule, ms per retry. `None` uses the default.
    pub backoff_schedule: Option<Vec<u64>>,
    /// Keys that receive the message value if delivery ultimately fails.
    pub keys_if_undelivered: Vec<Key>,
}

/// A dequeued message, leased to the consumer until acked or nacked.
#[derive(Clone, Debug, Serialize)]
pub struct QueueMessage {
    pub id: String,
    pub value: Value,
    pub attempts: u32,
}

/// What a nack did with the message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NackResult {
    /// Scheduled for another attempt at `ready_at` (epoch ms).
    Retry {
        #[serde(rename = "readyAt")]
        ready_at: i64,
    },
    /// Attempts exhausted: moved to the dead-letter queue.
    DeadLettered,
}

/// Queue counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub dlq: u64,
    pub total: u64,
}

/// A dead-letter row.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqMessage {
    pub id: String,
    pub original_id: String,
    pub value: Value,
    pub error_message: String,
    pub attempts: u32,
    pub original_created_at: i64,
    pub failed_at: i64,
}

/// One page of dead-letter rows.
#[derive(Clone, Debug, Serialize)]
pub struct DlqPage {
    pub messages: Vec<DlqMessage>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

impl Kv {
    /// Inserts a message. Ready after `delay_ms`; `max_attempts` is the
    /// schedule length plus one.
    pub fn enqueue(&self, value: &Value, options: EnqueueOptions) -> CResult<String> {
        self.metrics.observe("enqueue", || {
            let schedule = options
                .backoff_schedule
                .unwrap_or_else(|| DEFAULT_BACKOFF_MS.to_vec());
            let keys_json: Vec<Value> = options
                .keys_if_undelivered
                .iter()
                .map(|k| Value::Array(k.iter().map(|p| p.to_json()).collect()))
                .collect();
            for key in &options.keys_if_undelivered {
                if key.is_empty() {
                    return Err(Error::InvalidArgument(
                        "keys_if_undelivered entries must be non-empty keys".into(),
                    ));
                }
                encode_key(key)?;
            }

            let id = uuid::Uuid::new_v4().to_string();
            let now = now_ms();
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO kv_queue \
                 (id, value, ready_at, attempts, max_attempts, backoff_schedule, \
                  keys_if_undelivered, status, locked_until, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, 'pending', NULL, ?7, ?7)",
                params![
                    id,
                    serde_json::to_string(value)?,
                    now + options.delay_ms as i64,
                    schedule.len() as i64 + 1,
                    serde_json::to_string(&schedule)?,
                    serde_json::to_string(&keys_json)?,
                    now,
                ],
            )?;
            Ok(id)
        })
    }

    /// Takes the oldest ready message, if any, under the default lease.
    pub fn dequeue(&self) -> CResult<Option<QueueMessage>> {
        self.dequeue_with_lease(DEFAULT_LEASE_MS)
    }

    /// Takes the oldest ready message inside one write transaction: the
    /// status flip is the lock, so concurrent dequeuers never share a
    /// message while a lease is valid.
    pub fn dequeue_with_lease(&self, lease_ms: u64) -> CResult<Option<QueueMessage>> {
        self.metrics.observe("dequeue", || {
            let now = now_ms();
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row = tx
                .query_row(
                    "SELECT id, value, attempts FROM kv_queue \
                     WHERE status = 'pending' AND ready_at <= ?1 \
                     ORDER BY created_at ASC, id ASC LIMIT 1",
                    params![now],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, value_text, attempts)) = row else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE kv_queue SET status = 'processing', attempts = attempts + 1, \
                 locked_until = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, now + lease_ms as i64, now],
            )?;
            tx.commit()?;

            Ok(Some(QueueMessage {
                id,
                value: serde_json::from_str(&value_text)
                    .map_err(|e| Error::CorruptValue(e.to_string()))?,
                attempts: attempts as u32 + 1,
            }))
        })
    }

    /// Acknowledges (deletes) a message. No-op if it is already gone.
    pub fn ack(&self, id: &str) -> CResult<bool> {
        self.metrics.observe("ack", || {
            let conn = self.conn()?;
            let deleted = conn.execute("DELETE FROM kv_queue WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
    }

    /// Negative-acknowledges a message: schedules a retry per the backoff
    /// schedule, or dead-letters it when attempts are exhausted.
    pub fn nack(&self, id: &str) -> CResult<NackResult> {
        let (result, fallback_events) = self.metrics.observe("nack", || {
            let now = now_ms();
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row = tx
                .query_row(
                    "SELECT value, attempts, max_attempts, backoff_schedule, \
                            keys_if_undelivered, created_at \
                     FROM kv_queue WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((value_text, attempts, max_attempts, schedule_json, keys_json, created_at)) =
                row
            else {
                return Err(Error::NotFound(format!("queue message {}", id)));
            };

            if attempts < max_attempts {
                let schedule: Vec<u64> = serde_json::from_str(&schedule_json)?;
                // attempts is 1-based after dequeue; repeat the last entry
                // when the schedule is overshot.
                let idx = (attempts.max(1) as usize - 1).min(schedule.len().saturating_sub(1));
                let backoff = schedule.get(idx).copied().unwrap_or(0);
                let ready_at = now + backoff as i64;
                tx.execute(
                    "UPDATE kv_queue SET status = 'pending', ready_at = ?2, \
                     locked_until = NULL, updated_at = ?3 WHERE id = ?1",
                    params![id, ready_at, now],
                )?;
                tx.commit()?;
                return Ok((NackResult::Retry { ready_at }, Vec::new()));
            }

            // Terminal failure: DLQ insert plus fallback writes, one commit.
            tx.execute("DELETE FROM kv_queue WHERE id = ?1", params![id])?;
            tx.execute(
                "INSERT INTO kv_dlq \
                 (id, original_id, value, error_message, attempts, original_created_at, failed_at) \
                 VALUES (?1, ?2, ?3, 'Max attempts exceeded', ?4, ?5, ?6)",
                params![uuid::Uuid::new_v4().to_string(), id, value_text, attempts, created_at, now],
            )?;

            let mut events = Vec::new();
            let keys: Vec<Value> = serde_json::from_str(&keys_json)?;
            if !keys.is_empty() {
                let value: Value = serde_json::from_str(&value_text)
                    .map_err(|e| Error::CorruptValue(e.to_string()))?;
                let versionstamp = self.next_versionstamp();
                for key_json in &keys {
                    let key = key_from_json(key_json)?;
                    let key_bytes = encode_key(&key)?;
                    apply_set(&tx, &self.fts, &key_bytes, &value, &versionstamp, None)?;
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
            }
            tx.commit()?;
            Ok((NackResult::DeadLettered, events))
        })?;

        for (event, key_bytes) in &fallback_events {
            self.triggers.dispatch(event, key_bytes);
        }
        Ok(result)
    }

    /// Returns expired `processing` rows to `pending` without consuming an
    /// extra retry. Called by the lease-recovery sweeper.
    pub fn recover_leases(&self) -> CResult<u64> {
        let now = now_ms();
        let conn = self.conn()?;
        let recovered = conn.execute(
            "UPDATE kv_queue SET status = 'pending', locked_until = NULL, updated_at = ?1 \
             WHERE status = 'processing' AND locked_until < ?1",
            params![now],
        )?;
        if recovered > 0 {
            warn!("recovered {} expired queue leases", recovered);
        }
        Ok(recovered as u64)
    }

    pub fn queue_stats(&self) -> CResult<QueueStats> {
        let conn = self.conn()?;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_queue WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?;
        let processing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_queue WHERE status = 'processing'",
            [],
            |r| r.get(0),
        )?;
        let dlq: i64 = conn.query_row("SELECT COUNT(*) FROM kv_dlq", [], |r| r.get(0))?;
        Ok(QueueStats {
            pending: pending as u64,
            processing: processing as u64,
            dlq: dlq as u64,
            total: (pending + processing + dlq) as u64,
        })
    }

    /// Lists dead-letter rows, newest failures first, cursor-paginated.
    pub fn dlq_list(&self, cursor: Option<&str>, limit: Option<u32>) -> CResult<DlqPage> {
        let limit = clamp_limit(limit);
        let mut sql = String::from(
            "SELECT id, original_id, value, error_message, attempts, \
                    original_created_at, failed_at FROM kv_dlq",
        );
        let mut params_vec: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(cursor) = cursor {
            let raw = base64::engine::general_purpose::STANDARD
                .decode(cursor)
                .map_err(|e| Error::InvalidArgument(format!("bad cursor: {}", e)))?;
            let text = String::from_utf8(raw)
                .map_err(|e| Error::InvalidArgument(format!("bad cursor: {}", e)))?;
            let (failed_at, id) = text
                .split_once('|')
                .ok_or_else(|| Error::InvalidArgument("bad cursor".into()))?;
            let failed_at: i64 = failed_at
                .parse()
                .map_err(|_| Error::InvalidArgument("bad cursor".into()))?;
            sql.push_str(" WHERE (failed_at < ?1 OR (failed_at = ?1 AND id > ?2))");
            params_vec.push(rusqlite::types::Value::Integer(failed_at));
            params_vec.push(rusqlite::types::Value::Text(id.to_string()));
        }
        sql.push_str(" ORDER BY failed_at DESC, id ASC LIMIT ?");
        params_vec.push(rusqlite::types::Value::Integer(limit as i64 + 1));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt
            .query_map(rusqlite::params_from_iter(params_vec), row_to_dlq)?
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);
        let cursor = if has_more {
            rows.last().map(|m| {
                base64::engine::general_purpose::STANDARD
                    .encode(format!("{}|{}", m.failed_at, m.id))
            })
        } else {
            None
        };
        Ok(DlqPage { messages: rows, cursor, has_more })
    }

    pub fn dlq_get(&self, id: &str) -> CResult<DlqMessage> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, original_id, value, error_message, attempts, \
                    original_created_at, failed_at FROM kv_dlq WHERE id = ?1",
            params![id],
            row_to_dlq,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("dlq message {}", id)))
    }

    /// Moves a dead-letter row back into the queue with a clean slate.
    pub fn dlq_requeue(&self, id: &str) -> CResult<String> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                "SELECT original_id, value FROM kv_dlq WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((original_id, value_text)) = row else {
            return Err(Error::NotFound(format!("dlq message {}", id)));
        };

        let now = now_ms();
        let new_id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO kv_queue \
             (id, value, ready_at, attempts, max_attempts, backoff_schedule, \
              keys_if_undelivered, status, locked_until, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?5, '[]', 'pending', NULL, ?3, ?3)",
            params![
                new_id,
                value_text,
                now,
                DEFAULT_BACKOFF_MS.len() as i64 + 1,
                serde_json::to_string(DEFAULT_BACKOFF_MS)?,
            ],
        )?;
        tx.execute("DELETE FROM kv_dlq WHERE id = ?1", params![id])?;
        tx.commit()?;
        log::info!("requeued dlq message {} (originally {}) as {}", id, original_id, new_id);
        Ok(new_id)
    }

    pub fn dlq_delete(&self, id: &str) -> CResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM kv_dlq WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("dlq message {}", id)));
        }
        Ok(())
    }

    pub fn dlq_purge(&self) -> CResult<u64> {
        let conn = self.conn()?;
        let purged = conn.execute("DELETE FROM kv_dlq", [])?;
        Ok(purged as u64)
    }
}

fn row_to_dlq(row: &rusqlite::Row<'_>) -> Result<DlqMessage, rusqlite::Error> {
    let value_text: String = row.get(2)?;
    Ok(DlqMessage {
        id: row.get(0)?,
        original_id: row.get(1)?,
        value: serde_json::from_str(&value_text).unwrap_or(Value::Null),
        error_message: row.get(3)?,
        attempts: row.get::<_, i64>(4)? as u32,
        original_created_at: row.get(5)?,
        failed_at: row.get(6)?,
    })
}
