//! `tidekv` is a durable, versionstamped key-value engine layered on a
//! relational row store (SQLite), plus a reliable queue on the same
//! transactional substrate.
//!
//! Keys are ordered composite tuples with an order-preserving binary
//! encoding, so prefix and range scans run directly over the row store's
//! `BLOB` primary key. Every successful commit is tagged with a
//! monotonically increasing versionstamp; atomic operations check stamps
//! before writing, and the snapshot-transaction facade turns cached reads
//! into those checks automatically. Structured filters compile to
//! parameterized SQL over the JSON value column, and per-prefix FTS5 indexes
//! stay in sync with the KV on every write.
//!
//! ## Getting started
//!
//! ```rust
//! use serde_json::json;
//! use tidekv::codec::KeyPart;
//! use tidekv::error::CResult;
//! use tidekv::store::{Kv, SetOptions};
//!
//! fn main() -> CResult<()> {
//!     let kv = Kv::open_in_memory()?;
//!     let key = vec![KeyPart::Text("users".into()), KeyPart::Number(1.0)];
//!
//!     kv.set(&key, &json!({"name": "ada"}), SetOptions::default())?;
//!     let entry = kv.get(&key)?;
//!     assert_eq!(entry.value, Some(json!({"name": "ada"})));
//!
//!     // Optimistic concurrency: the write lands only if the stamp held.
//!     let result = kv
//!         .atomic()
//!         .check(key.clone(), entry.versionstamp)
//!         .set(key.clone(), json!({"name": "ada lovelace"}))
//!         .commit()?;
//!     assert!(result.ok);
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod codec;
pub mod error;
pub mod filter;
pub mod fts;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod trigger;
pub mod txn;
pub mod version;
pub mod watch;

pub use codec::{Key, KeyPart};
pub use error::{CResult, Error};
pub use store::{Entry, Kv};
