//! Engine operations: point reads/writes, tree delete, range listing,
//! counting, pagination, TTL sweep, FTS management, and trigger wiring.

use base64::Engine as _;
use log::warn;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;

use crate::codec::key::{decode_key, display_key, encode_key, prefix_range, Key};
use crate::codec::value;
use crate::error::{CResult, Error};
use crate::filter::compile_where;
use crate::fts::{self, FtsRegistry, IndexInfo, DEFAULT_TOKENIZER};
use crate::trigger::{ChangeEvent, EventKind, TriggerHandler, TriggerId};

use super::{
    now_s, ttl_deadline, CommitResult, Entry, Kv, ListOptions, Page, PaginateOptions, SetOptions,
    Status, DEFAULT_LIMIT, MAX_LIMIT,
};

/// Clamps a requested page size to `[1, MAX_LIMIT]`.
pub(crate) fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn require_stored_key(key: &Key) -> CResult<Vec<u8>> {
    if key.is_empty() {
        return Err(Error::InvalidArgument(
            "empty key is only valid as a prefix".into(),
        ));
    }
    encode_key(key)
}

/// Upserts one entry row and its FTS projection. Runs inside the caller's
/// write transaction; the caller dispatches triggers after commit.
pub(crate) fn apply_set(
    tx: &Transaction,
    fts_registry: &FtsRegistry,
    key_bytes: &[u8],
    value: &Value,
    versionstamp: &str,
    expires_at: Option<i64>,
) -> CResult<()> {
    let value_text =
        serde_json::to_string(value).map_err(|e| Error::Parse(e.to_string()))?;
    tx.execute(
        "INSERT INTO kv_entries (key, value, versionstamp, expires_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (key) DO UPDATE SET \
         value = excluded.value, versionstamp = excluded.versionstamp, \
         expires_at = excluded.expires_at",
        params![key_bytes, value_text, versionstamp, expires_at],
    )?;
    if let Some(def) = fts_registry.matching(tx, key_bytes)? {
        fts::sync_set(tx, &def, key_bytes, value)?;
    }
    Ok(())
}

/// Deletes one exact entry row and its FTS projection.
pub(crate) fn apply_delete_exact(
    tx: &Transaction,
    fts_registry: &FtsRegistry,
    key_bytes: &[u8],
) -> CResult<u64> {
    let deleted = tx.execute("DELETE FROM kv_entries WHERE key = ?1", params![key_bytes])?;
    if deleted > 0 {
        if let Some(def) = fts_registry.matching(tx, key_bytes)? {
            fts::sync_delete(tx, &def, key_bytes)?;
        }
    }
    Ok(deleted as u64)
}

fn row_to_entry(
    key_bytes: Vec<u8>,
    value_text: String,
    versionstamp: String,
    expires_at: Option<i64>,
) -> CResult<Entry> {
    Ok(Entry {
        key: decode_key(&key_bytes)?,
        value: Some(value::deserialize_value(value_text.as_bytes())?),
        versionstamp: Some(versionstamp),
        expires_at,
    })
}

impl Kv {
    /// Point read. Misses and expired entries come back with null value and
    /// versionstamp; decode failures on a direct get propagate.
    pub fn get(&self, key: &Key) -> CResult<Entry> {
        self.metrics.observe("get", || {
            let key_bytes = require_stored_key(key)?;
            let conn = self.conn()?;
            let row = conn
                .query_row(
                    "SELECT value, versionstamp, expires_at FROM kv_entries \
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key_bytes, now_s()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some((value_text, versionstamp, expires_at)) => {
                    row_to_entry(key_bytes, value_text, versionstamp, expires_at)
                }
                None => Ok(Entry::miss(key.clone())),
            }
        })
    }

    /// Batched point read: one `IN (…)` query, results in request order with
    /// misses as null entries. An empty batch returns empty.
    pub fn get_many(&self, keys: &[Key]) -> CResult<Vec<Entry>> {
        self.metrics.observe("get_many", || {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let mut encoded = Vec::with_capacity(keys.len());
            for key in keys {
                encoded.push(require_stored_key(key)?);
            }
            let placeholders = vec!["?"; encoded.len()].join(", ");
            let sql = format!(
                "SELECT key, value, versionstamp, expires_at FROM kv_entries \
                 WHERE key IN ({}) AND (expires_at IS NULL OR expires_at > {})",
                placeholders,
                now_s()
            );
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(encoded.iter().map(|k| SqlValue::Blob(k.clone()))),
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let mut by_key = std::collections::HashMap::new();
            for (key_bytes, value_text, stamp, expires_at) in rows {
                let entry = row_to_entry(key_bytes.clone(), value_text, stamp, expires_at)?;
                by_key.insert(key_bytes, entry);
            }
            Ok(keys
                .iter()
                .zip(encoded)
                .map(|(key, bytes)| by_key.remove(&bytes).unwrap_or_else(|| Entry::miss(key.clone())))
                .collect())
        })
    }

    /// Upserts one entry under a fresh versionstamp and fires one `set`
    /// trigger event after the write is durable.
    pub fn set(&self, key: &Key, value: &Value, options: SetOptions) -> CResult<CommitResult> {
        let result = self.metrics.observe("set", || {
            let key_bytes = require_stored_key(key)?;
            let versionstamp = self.stamps.next();
            let expires_at = options.expire_in_ms.map(ttl_deadline);

            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            apply_set(&tx, &self.fts, &key_bytes, value, &versionstamp, expires_at)?;
            tx.commit()?;
            Ok::<_, Error>((key_bytes, versionstamp))
        })?;

        let (key_bytes, versionstamp) = result;
        self.triggers.dispatch(
            &ChangeEvent {
                kind: EventKind::Set,
                key: key.clone(),
                value: Some(value.clone()),
                versionstamp: Some(versionstamp.clone()),
            },
            &key_bytes,
        );
        Ok(CommitResult::committed(versionstamp))
    }

    /// Tree delete: removes the entry at `prefix` and every entry under it,
    /// optionally constrained by a filter. Fires a single `delete` trigger
    /// event for the prefix and returns the number of rows removed.
    pub fn delete(&self, prefix: &Key, r#where: Option<&Value>) -> CResult<u64> {
        let deleted = self.metrics.observe("delete", || {
            let exact = encode_key(prefix)?;
            let (start, end) = prefix_range(prefix)?;
            let filter = compile_where(r#where, "value")?;

            let mut conn = self.conn()?;
            let tx = conn.transaction()?;

            let sql = format!(
                "SELECT key FROM kv_entries \
                 WHERE (key = ?1 OR (key >= ?2 AND key < ?3)) AND ({})",
                filter.sql
            );
            let mut doomed: Vec<Vec<u8>> = Vec::new();
            {
                let mut stmt = tx.prepare(&sql)?;
                let mut all_params: Vec<SqlValue> = vec![
                    SqlValue::Blob(exact.clone()),
                    SqlValue::Blob(start),
                    SqlValue::Blob(end),
                ];
                all_params.extend(filter.params.iter().cloned());
                let rows = stmt.query_map(rusqlite::params_from_iter(all_params), |row| {
                    row.get::<_, Vec<u8>>(0)
                })?;
                for row in rows {
                    doomed.push(row?);
                }
            }

            let mut deleted = 0u64;
            for key_bytes in &doomed {
                deleted += apply_delete_exact(&tx, &self.fts, key_bytes)?;
            }
            tx.commit()?;
            Ok::<_, Error>(deleted)
        })?;

        let key_bytes = encode_key(prefix)?;
        self.triggers.dispatch(
            &ChangeEvent {
                kind: EventKind::Delete,
                key: prefix.clone(),
                value: None,
                versionstamp: None,
            },
            &key_bytes,
        );
        Ok(deleted)
    }

    /// Ordered range listing under a prefix. `start`/`end` bound the
    /// physical (ascending) key space regardless of direction; `reverse`
    /// flips emission order. Corrupt rows are logged, counted, and skipped.
    pub fn list(&self, prefix: &Key, options: &ListOptions) -> CResult<Vec<Entry>> {
        self.metrics.observe("list", || {
            let exact = encode_key(prefix)?;
            let (start, end) = prefix_range(prefix)?;
            let limit = clamp_limit(options.limit);
            let filter = compile_where(options.r#where.as_ref(), "value")?;

            let mut sql = format!(
                "SELECT key, value, versionstamp, expires_at FROM kv_entries \
                 WHERE (key = ?1 OR (key >= ?2 AND key < ?3)) \
                   AND (expires_at IS NULL OR expires_at > ?4) \
                   AND ({})",
                filter.sql
            );
            let mut all_params: Vec<SqlValue> = vec![
                SqlValue::Blob(exact),
                SqlValue::Blob(start),
                SqlValue::Blob(end),
                SqlValue::Integer(now_s()),
            ];
            all_params.extend(filter.params.iter().cloned());
            if let Some(start_key) = &options.start {
                sql.push_str(" AND key >= ?");
                all_params.push(SqlValue::Blob(encode_key(start_key)?));
            }
            if let Some(end_key) = &options.end {
                sql.push_str(" AND key < ?");
                all_params.push(SqlValue::Blob(encode_key(end_key)?));
            }
            sql.push_str(if options.reverse {
                " ORDER BY key DESC LIMIT ?"
            } else {
                " ORDER BY key ASC LIMIT ?"
            });
            all_params.push(SqlValue::Integer(limit as i64));

            let conn = self.conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(all_params), |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut entries = Vec::with_capacity(rows.len());
            for (key_bytes, value_text, stamp, expires_at) in rows {
                match row_to_entry(key_bytes, value_text, stamp, expires_at) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        self.metrics.record_error("decode");
                        warn!("skipping corrupt row in list: {}", err);
                    }
                }
            }
            Ok(entries)
        })
    }

    /// Live-entry count under a prefix.
    pub fn count(&self, prefix: &Key) -> CResult<u64> {
        self.metrics.observe("count", || {
            let exact = encode_key(prefix)?;
            let (start, end) = prefix_range(prefix)?;
            let conn = self.conn()?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM kv_entries \
                 WHERE (key = ?1 OR (key >= ?2 AND key < ?3)) \
                   AND (expires_at IS NULL OR expires_at > ?4)",
                params![exact, start, end, now_s()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Cursor pagination: fetches `limit + 1` rows to derive `has_more`, and
    /// hands back an opaque cursor (base64 of the last-seen encoded key).
    pub fn paginate(&self, prefix: &Key, options: &PaginateOptions) -> CResult<Page> {
        self.metrics.observe("paginate", || {
            let exact = encode_key(prefix)?;
            let (start, end) = prefix_range(prefix)?;
            let limit = clamp_limit(options.limit);

            let mut sql = String::from(
                "SELECT key, value, versionstamp, expires_at FROM kv_entries \
                 WHERE (key = ?1 OR (key >= ?2 AND key < ?3)) \
                   AND (expires_at IS NULL OR expires_at > ?4)",
            );
            let mut all_params: Vec<SqlValue> = vec![
                SqlValue::Blob(exact),
                SqlValue::Blob(start),
                SqlValue::Blob(end),
                SqlValue::Integer(now_s()),
            ];
            if let Some(cursor) = &options.cursor {
                let last_key = base64::engine::general_purpose::STANDARD
                    .decode(cursor)
                    .map_err(|e| Error::InvalidArgument(format!("bad cursor: {}", e)))?;
                sql.push_str(if options.reverse { " AND key < ?" } else { " AND key > ?" });
                all_params.push(SqlValue::Blob(last_key));
            }
            sql.push_str(if options.reverse {
                " ORDER BY key DESC LIMIT ?"
            } else {
                " ORDER BY key ASC LIMIT ?"
            });
            all_params.push(SqlValue::Integer(limit as i64 + 1));

            let conn = self.conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(rusqlite::params_from_iter(all_params), |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let has_more = rows.len() > limit as usize;
            rows.truncate(limit as usize);
            let cursor = rows
                .last()
                .map(|(key_bytes, ..)| base64::engine::general_purpose::STANDARD.encode(key_bytes));

            let mut entries = Vec::with_capacity(rows.len());
            for (key_bytes, value_text, stamp, expires_at) in rows {
                match row_to_entry(key_bytes, value_text, stamp, expires_at) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        self.metrics.record_error("decode");
                        warn!("skipping corrupt row in paginate: {}", err);
                    }
                }
            }
            Ok(Page { entries, cursor: if has_more { cursor } else { None }, has_more })
        })
    }

    /// Engine status for operators and the `/status` endpoint.
    pub fn status(&self) -> CResult<Status> {
        let conn = self.conn()?;
        let now = now_s();
        let (keys, size): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), SUM(LENGTH(value)) FROM kv_entries \
             WHERE expires_at IS NULL OR expires_at > ?1",
            params![now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        let processing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_queue WHERE status = 'processing'",
            [],
            |row| row.get(0),
        )?;
        let dlq: i64 = conn.query_row("SELECT COUNT(*) FROM kv_dlq", [], |row| row.get(0))?;
        Ok(Status {
            name: "tidekv".into(),
            keys: keys as u64,
            size: size.unwrap_or(0) as u64,
            queue_pending: pending as u64,
            queue_processing: processing as u64,
            dlq: dlq as u64,
        })
    }

    /// Removes expired rows (and their FTS projections). Called by the
    /// background sweeper; safe to run concurrently with everything else.
    pub fn sweep_expired(&self) -> CResult<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT key FROM kv_entries \
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            )?;
            let rows = stmt.query_map(params![now_s()], |row| row.get::<_, Vec<u8>>(0))?;
            for row in rows {
                doomed.push(row?);
            }
        }
        let mut swept = 0u64;
        for key_bytes in &doomed {
            swept += apply_delete_exact(&tx, &self.fts, key_bytes)?;
        }
        tx.commit()?;
        Ok(swept)
    }

    /// Registers a change trigger for mutations under `prefix`.
    pub fn on(
        &self,
        prefix: &Key,
        kinds: Vec<EventKind>,
        handler: TriggerHandler,
    ) -> CResult<TriggerId> {
        let prefix_bytes = encode_key(prefix)?;
        Ok(self.triggers.on(prefix_bytes, kinds, handler))
    }

    /// Unregisters a change trigger.
    pub fn off(&self, id: TriggerId) {
        self.triggers.off(id)
    }

    /// Creates (or replaces) a full-text index over `prefix` and backfills
    /// it from the entries already stored there.
    pub fn create_index(
        &self,
        prefix: &Key,
        fields: &[String],
        tokenizer: Option<&str>,
    ) -> CResult<IndexInfo> {
        self.metrics.observe("create_index", || {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let def = fts::create_index(
                &tx,
                prefix,
                fields,
                tokenizer.unwrap_or(DEFAULT_TOKENIZER),
            )?;
            tx.commit()?;
            self.fts.invalidate();
            Ok(IndexInfo {
                prefix: prefix.clone(),
                fields: def.fields,
                tokenizer: def.tokenizer,
                table_name: def.table_name,
            })
        })
    }

    pub fn drop_index(&self, prefix: &Key) -> CResult<()> {
        self.metrics.observe("drop_index", || {
            let conn = self.conn()?;
            fts::drop_index(&conn, prefix)?;
            self.fts.invalidate();
            Ok(())
        })
    }

    pub fn list_indexes(&self) -> CResult<Vec<IndexInfo>> {
        let conn = self.conn()?;
        fts::list_indexes(&conn)
    }

    /// Full-text search under an indexed prefix, ordered by relevance.
    pub fn search(
        &self,
        prefix: &Key,
        query: &str,
        limit: Option<u32>,
        r#where: Option<&Value>,
    ) -> CResult<Vec<Entry>> {
        self.metrics.observe("search", || {
            let filter = compile_where(r#where, "e.value")?;
            let conn = self.conn()?;
            let rows = fts::search_rows(
                &conn,
                &self.fts,
                prefix,
                query,
                clamp_limit(limit),
                &filter.sql,
                &filter.params,
                now_s(),
            )?;
            let mut entries = Vec::with_capacity(rows.len());
            for (key_bytes, value_text, stamp, expires_at) in rows {
                match row_to_entry(key_bytes, value_text, stamp, expires_at) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        self.metrics.record_error("decode");
                        warn!("skipping corrupt row in search: {}", err);
                    }
                }
            }
            Ok(entries)
        })
    }

    /// Flushes metric aggregates into the metrics table. Failures are
    /// logged inside the sink and never surfaced.
    pub fn flush_metrics(&self) -> CResult<()> {
        let conn = self.conn()?;
        self.metrics.flush(&conn);
        Ok(())
    }

    /// Access to the versionstamp issuer, for components (queue fallback
    /// writes, atomic commits) that stamp their own rows.
    pub(crate) fn next_versionstamp(&self) -> String {
        self.stamps.next()
    }

    /// Human-readable key rendering for errors and logs.
    pub fn display(key: &Key) -> String {
        display_key(key)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::codec::key::KeyPart;

    fn kv() -> Kv {
        Kv::open_in_memory().unwrap()
    }

    fn key(parts: &[&str]) -> Key {
        parts.iter().map(|p| KeyPart::Text(p.to_string())).collect()
    }

    fn nkey(name: &str, n: f64) -> Key {
        vec![KeyPart::Text(name.into()), KeyPart::Number(n)]
    }

    #[test]
    fn set_get_roundtrip() {
        let kv = kv();
        let k = key(&["users", "1"]);
        let result = kv.set(&k, &json!({"name": "ada"}), SetOptions::default()).unwrap();
        assert!(result.ok);

        let entry = kv.get(&k).unwrap();
        assert_eq!(entry.value, Some(json!({"name": "ada"})));
        assert_eq!(entry.versionstamp, result.versionstamp);
    }

    #[test]
    fn get_missing_is_null_entry() {
        let kv = kv();
        let entry = kv.get(&key(&["nope"])).unwrap();
        assert!(!entry.exists());
        assert_eq!(entry.value, None);
    }

    #[test]
    fn empty_key_is_rejected_for_point_ops() {
        let kv = kv();
        assert!(matches!(kv.get(&vec![]), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            kv.set(&vec![], &json!(1), SetOptions::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn versionstamps_strictly_increase_across_sets() {
        let kv = kv();
        let mut prev = String::new();
        for i in 0..20 {
            let result = kv
                .set(&nkey("seq", i as f64), &json!(i), SetOptions::default())
                .unwrap();
            let stamp = result.versionstamp.unwrap();
            assert!(stamp > prev);
            prev = stamp;
        }
    }

    #[test]
    fn get_many_preserves_request_order() {
        let kv = kv();
        kv.set(&key(&["a"]), &json!(1), SetOptions::default()).unwrap();
        kv.set(&key(&["c"]), &json!(3), SetOptions::default()).unwrap();

        let entries = kv.get_many(&[key(&["c"]), key(&["b"]), key(&["a"])]).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].value, Some(json!(3)));
        assert_eq!(entries[1].value, None);
        assert_eq!(entries[2].value, Some(json!(1)));

        assert_eq!(kv.get_many(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn tree_delete_removes_prefix_and_extensions() {
        let kv = kv();
        kv.set(&nkey("u", 1.0), &json!({}), SetOptions::default()).unwrap();
        let mut child = nkey("u", 1.0);
        child.push(KeyPart::Text("p".into()));
        kv.set(&child, &json!({}), SetOptions::default()).unwrap();
        kv.set(&nkey("u", 2.0), &json!({}), SetOptions::default()).unwrap();

        let deleted = kv.delete(&nkey("u", 1.0), None).unwrap();
        assert_eq!(deleted, 2);

        let remaining = kv.list(&key(&["u"]), &ListOptions::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, nkey("u", 2.0));
        assert!(!kv.get(&nkey("u", 1.0)).unwrap().exists());
    }

    #[test]
    fn delete_with_filter_only_removes_matches() {
        let kv = kv();
        for i in 0..4 {
            kv.set(
                &nkey("s", i as f64),
                &json!({"active": i % 2 == 0}),
                SetOptions::default(),
            )
            .unwrap();
        }
        let deleted = kv.delete(&key(&["s"]), Some(&json!({"active": true}))).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(kv.count(&key(&["s"])).unwrap(), 2);
    }

    #[test]
    fn list_is_ordered_and_reversible() {
        let kv = kv();
        for i in [3.0, 1.0, 2.0] {
            kv.set(&nkey("k", i), &json!(i), SetOptions::default()).unwrap();
        }
        let asc: Vec<f64> = kv
            .list(&key(&["k"]), &ListOptions::default())
            .unwrap()
            .iter()
            .map(|e| e.value.as_ref().unwrap().as_f64().unwrap())
            .collect();
        assert_eq!(asc, vec![1.0, 2.0, 3.0]);

        let desc: Vec<f64> = kv
            .list(&key(&["k"]), &ListOptions { reverse: true, ..Default::default() })
            .unwrap()
            .iter()
            .map(|e| e.value.as_ref().unwrap().as_f64().unwrap())
            .collect();
        assert_eq!(desc, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn list_start_end_apply_in_physical_space() {
        let kv = kv();
        for i in 0..5 {
            kv.set(&nkey("k", i as f64), &json!(i), SetOptions::default()).unwrap();
        }
        let opts = ListOptions {
            start: Some(nkey("k", 1.0)),
            end: Some(nkey("k", 4.0)),
            reverse: true,
            ..Default::default()
        };
        let got: Vec<f64> = kv
            .list(&key(&["k"]), &opts)
            .unwrap()
            .iter()
            .map(|e| e.value.as_ref().unwrap().as_f64().unwrap())
            .collect();
        // Bounds select [1, 4); reverse only flips emission order.
        assert_eq!(got, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn list_with_filter_returns_matching_in_key_order() {
        let kv = kv();
        for i in 0..4 {
            kv.set(
                &nkey("s", i as f64),
                &json!({"active": i % 2 == 0}),
                SetOptions::default(),
            )
            .unwrap();
        }
        let entries = kv
            .list(
                &key(&["s"]),
                &ListOptions { r#where: Some(json!({"active": {"eq": true}})), ..Default::default() },
            )
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, nkey("s", 0.0));
        assert_eq!(entries[1].key, nkey("s", 2.0));
    }

    #[test]
    fn count_matches_unbounded_list() {
        let kv = kv();
        for i in 0..7 {
            kv.set(&nkey("c", i as f64), &json!(i), SetOptions::default()).unwrap();
        }
        // The prefix entry itself counts too.
        kv.set(&key(&["c"]), &json!("root"), SetOptions::default()).unwrap();

        let count = kv.count(&key(&["c"])).unwrap();
        let listed = kv
            .list(&key(&["c"]), &ListOptions { limit: Some(MAX_LIMIT), ..Default::default() })
            .unwrap();
        assert_eq!(count, listed.len() as u64);
        assert_eq!(count, 8);
    }

    #[test]
    fn paginate_walks_the_whole_range() {
        let kv = kv();
        for i in 0..10 {
            kv.set(&nkey("p", i as f64), &json!(i), SetOptions::default()).unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = kv
                .paginate(
                    &key(&["p"]),
                    &PaginateOptions { cursor: cursor.clone(), limit: Some(3), reverse: false },
                )
                .unwrap();
            seen.extend(
                page.entries
                    .iter()
                    .map(|e| e.value.as_ref().unwrap().as_i64().unwrap()),
            );
            if !page.has_more {
                break;
            }
            cursor = page.cursor;
            assert!(cursor.is_some());
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn paginate_reverse_continues_downward() {
        let kv = kv();
        for i in 0..6 {
            kv.set(&nkey("p", i as f64), &json!(i), SetOptions::default()).unwrap();
        }
        let first = kv
            .paginate(
                &key(&["p"]),
                &PaginateOptions { cursor: None, limit: Some(4), reverse: true },
            )
            .unwrap();
        assert!(first.has_more);
        let second = kv
            .paginate(
                &key(&["p"]),
                &PaginateOptions { cursor: first.cursor.clone(), limit: Some(4), reverse: true },
            )
            .unwrap();
        let got: Vec<i64> = first
            .entries
            .iter()
            .chain(second.entries.iter())
            .map(|e| e.value.as_ref().unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(got, vec![5, 4, 3, 2, 1, 0]);
        assert!(!second.has_more);
    }

    #[test]
    fn bad_cursor_is_invalid_argument() {
        let kv = kv();
        let result = kv.paginate(
            &key(&["p"]),
            &PaginateOptions { cursor: Some("!!!not-base64!!!".into()), ..Default::default() },
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn expired_entries_are_invisible_and_swept() {
        let kv = kv();
        let k = key(&["ttl"]);
        // Already past its deadline: expires_at rounds to the current second.
        kv.set(&k, &json!(1), SetOptions { expire_in_ms: Some(0) }).unwrap();
        // Force the deadline into the past to avoid racing the rounding.
        let conn = kv.conn().unwrap();
        conn.execute("UPDATE kv_entries SET expires_at = 1", []).unwrap();
        drop(conn);

        assert!(!kv.get(&k).unwrap().exists());
        assert_eq!(kv.count(&key(&[])).unwrap(), 0);
        assert_eq!(kv.sweep_expired().unwrap(), 1);
        let conn = kv.conn().unwrap();
        let raw: i64 = conn
            .query_row("SELECT COUNT(*) FROM kv_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(raw, 0);
    }

    #[test]
    fn set_and_delete_fire_triggers_after_commit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let kv = kv();
        let sets = Arc::new(AtomicUsize::new(0));
        let deletes = Arc::new(AtomicUsize::new(0));

        let s = sets.clone();
        kv.on(
            &key(&["users"]),
            vec![EventKind::Set],
            Box::new(move |event| {
                assert!(event.versionstamp.is_some());
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        let d = deletes.clone();
        kv.on(
            &key(&["users"]),
            vec![EventKind::Delete],
            Box::new(move |event| {
                assert!(event.value.is_none());
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

        kv.set(&key(&["users", "1"]), &json!({}), SetOptions::default()).unwrap();
        kv.set(&key(&["orders", "1"]), &json!({}), SetOptions::default()).unwrap();
        kv.delete(&key(&["users", "1"]), None).unwrap();

        assert_eq!(sets.load(Ordering::SeqCst), 1);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fts_index_lifecycle() {
        let kv = kv();
        kv.set(
            &nkey("posts", 1.0),
            &json!({"title": "Rust ownership explained", "body": "borrow checker"}),
            SetOptions::default(),
        )
        .unwrap();

        // Backfill picks up the pre-existing entry.
        kv.create_index(&key(&["posts"]), &["title".into(), "body".into()], None)
            .unwrap();
        let hits = kv.search(&key(&["posts"]), "ownership", None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, nkey("posts", 1.0));

        // Writes keep the index in sync.
        kv.set(
            &nkey("posts", 2.0),
            &json!({"title": "Queues with backoff", "body": "retry schedule"}),
            SetOptions::default(),
        )
        .unwrap();
        let hits = kv.search(&key(&["posts"]), "backoff", None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, nkey("posts", 2.0));

        // Deletes drop index rows.
        kv.delete(&nkey("posts", 2.0), None).unwrap();
        assert!(kv.search(&key(&["posts"]), "backoff", None, None).unwrap().is_empty());

        // Search with a filter narrows hits.
        let hits = kv
            .search(
                &key(&["posts"]),
                "ownership",
                None,
                Some(&json!({"body": {"contains": "borrow"}})),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);

        // Unknown prefix is not-found.
        assert!(matches!(
            kv.search(&key(&["absent"]), "x", None, None),
            Err(Error::NotFound(_))
        ));

        kv.drop_index(&key(&["posts"])).unwrap();
        assert!(kv.list_indexes().unwrap().is_empty());
        assert!(matches!(
            kv.search(&key(&["posts"]), "ownership", None, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn status_reports_counts() {
        let kv = kv();
        kv.set(&key(&["a"]), &json!({"x": 1}), SetOptions::default()).unwrap();
        let status = kv.status().unwrap();
        assert_eq!(status.keys, 1);
        assert!(status.size > 0);
        assert_eq!(status.dlq, 0);
    }
}
