//! Snapshot transactions: a read-caching, write-buffering facade that
//! commits through the atomic committer.
//!
//! Reads are cached by encoded key; the first observed versionstamp of every
//! read becomes a check at commit time (`None` for keys that did not exist),
//! so the commit succeeds only if nothing read has changed underneath. Writes
//! are buffered and visible to later reads in the same transaction.
//!
//! Only conflicts retry, with exponential backoff plus jitter
//! (`base * 2^attempt + random(0..base)`). Closure errors surface without
//! retry and without applying any write.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::atomic::Mutation;
use crate::codec::key::{encode_key, Key};
use crate::error::{CResult, Error};
use crate::store::{Entry, Kv};

/// Retry policy for [`Kv::transaction`].
#[derive(Clone, Debug)]
pub struct TransactionOptions {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions { max_retries: 3, backoff_base_ms: 10 }
    }
}

/// Outcome of a transaction run.
#[derive(Clone, Debug, PartialEq)]
pub enum TransactionOutcome<T> {
    /// The closure ran and its writes committed.
    Committed { value: T, versionstamp: String },
    /// A read changed underneath the transaction and retries ran out.
    Conflict,
    /// The closure itself failed; nothing was written, nothing retried.
    Failed { message: String },
}

impl<T> TransactionOutcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }
}

/// An open transaction handle. Obtained from [`Kv::begin`] or inside a
/// [`Kv::transaction`] closure.
pub struct Txn<'a> {
    kv: &'a Kv,
    /// First-observed entry per encoded key. Re-reads serve these, and their
    /// versionstamps (including `None` for absent keys) become checks.
    reads: HashMap<Vec<u8>, Entry>,
    /// Buffered values for read-your-writes. `None` marks a buffered delete.
    overlay: HashMap<Vec<u8>, Option<Value>>,
    writes: Vec<Mutation>,
    closed: bool,
}

impl Kv {
    /// Opens a transaction handle for manual use. Prefer [`Kv::transaction`],
    /// which adds the retry loop.
    pub fn begin(&self) -> Txn<'_> {
        Txn {
            kv: self,
            reads: HashMap::new(),
            overlay: HashMap::new(),
            writes: Vec::new(),
            closed: false,
        }
    }

    /// Runs `f` in a transaction, committing its buffered writes with the
    /// observed reads as checks. Conflicts rerun the closure on a fresh
    /// handle up to `options.max_retries` times.
    pub fn transaction<T>(
        &self,
        options: TransactionOptions,
        mut f: impl FnMut(&mut Txn) -> CResult<T>,
    ) -> CResult<TransactionOutcome<T>> {
        for attempt in 0..=options.max_retries {
            let mut txn = self.begin();
            let value = match f(&mut txn) {
                Ok(value) => value,
                Err(err) => return Ok(TransactionOutcome::Failed { message: err.to_string() }),
            };
            match txn.commit()? {
                Some(versionstamp) => {
                    return Ok(TransactionOutcome::Committed { value, versionstamp })
                }
                None if attempt < options.max_retries => {
                    let backoff = options.backoff_base_ms.saturating_mul(1u64 << attempt.min(16))
                        + rand::thread_rng().gen_range(0..options.backoff_base_ms.max(1));
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                None => return Ok(TransactionOutcome::Conflict),
            }
        }
        Ok(TransactionOutcome::Conflict)
    }
}

impl<'a> Txn<'a> {
    fn ensure_open(&self) -> CResult<()> {
        if self.closed {
            return Err(Error::TransactionClosed);
        }
        Ok(())
    }

    /// Cached read. The first read of a key pins the versionstamp this
    /// transaction will be checked against; later reads of the same key
    /// return the cached entry even if the store moved on.
    pub fn get(&mut self, key: &Key) -> CResult<Entry> {
        self.ensure_open()?;
        let key_bytes = encode_key(key)?;

        if let Some(buffered) = self.overlay.get(&key_bytes) {
            return Ok(match buffered {
                Some(value) => Entry {
                    key: key.clone(),
                    value: Some(value.clone()),
                    versionstamp: None,
                    expires_at: None,
                },
                None => Entry::miss(key.clone()),
            });
        }
        if let Some(cached) = self.reads.get(&key_bytes) {
            // Second read of the same key: the first observation wins, even
            // if the underlying store changed in the meantime.
            return Ok(cached.clone());
        }

        let entry = self.kv.get(key)?;
        self.reads.insert(key_bytes, entry.clone());
        Ok(entry)
    }

    /// Batched cached read, one entry per requested key in order.
    pub fn get_many(&mut self, keys: &[Key]) -> CResult<Vec<Entry>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Buffers an upsert, visible to later reads in this transaction.
    pub fn set(&mut self, key: &Key, value: Value) -> CResult<()> {
        self.ensure_open()?;
        let key_bytes = encode_key(key)?;
        self.overlay.insert(key_bytes, Some(value.clone()));
        self.writes.push(Mutation::Set { key: key.clone(), value, expire_in_ms: None });
        Ok(())
    }

    /// Buffers an exact-key delete.
    pub fn delete(&mut self, key: &Key) -> CResult<()> {
        self.ensure_open()?;
        let key_bytes = encode_key(key)?;
        self.overlay.insert(key_bytes, None);
        self.writes.push(Mutation::Delete { key: key.clone() });
        Ok(())
    }

    /// Buffers a 64-bit counter addition.
    pub fn sum(&mut self, key: &Key, operand: Value) -> CResult<()> {
        self.ensure_open()?;
        let key_bytes = encode_key(key)?;
        // The result depends on commit-time state; drop any stale overlay.
        self.overlay.remove(&key_bytes);
        self.writes.push(Mutation::Sum { key: key.clone(), value: operand });
        Ok(())
    }

    /// Builds and commits the atomic operation: every first-observed read
    /// becomes a check, every buffered write a mutation. Returns the commit
    /// versionstamp, or `None` on conflict. The handle is closed either way.
    pub fn commit(&mut self) -> CResult<Option<String>> {
        self.ensure_open()?;
        self.closed = true;

        let mut op = self.kv.atomic();
        for observed in self.reads.values() {
            op = op.check(observed.key.clone(), observed.versionstamp.clone());
        }
        for mutation in self.writes.drain(..) {
            op = op.mutate(mutation);
        }
        let result = op.commit()?;
        Ok(result.versionstamp)
    }
}
