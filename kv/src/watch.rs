//! Watch support: stamp-diff computation over key sets and prefixes.
//!
//! The polling loop and SSE framing live at the HTTP edge; this module
//! computes deltas between a client's last-known versionstamps and the
//! current store state. Watchers may coalesce intermediate stamps; the
//! guarantee is only that the last emitted stamp is the most recent at
//! emission time.

use std::collections::BTreeMap;

use crate::codec::key::Key;
use crate::error::CResult;
use crate::store::{Entry, Kv, ListOptions};

/// Result of one key-set poll: entries whose stamp changed, plus the full
/// new stamp vector (aligned with the requested keys).
#[derive(Debug)]
pub struct KeySetDelta {
    pub changed: Vec<Entry>,
    pub stamps: Vec<Option<String>>,
}

/// Result of one prefix poll: changed entries (deletions as null entries)
/// plus the new snapshot keyed by hex-encoded key.
#[derive(Debug)]
pub struct PrefixDelta {
    pub changed: Vec<Entry>,
    pub snapshot: BTreeMap<String, String>,
}

/// Compares the current state of `keys` against `known` stamps. `known` may
/// be shorter than `keys` (missing slots count as never-seen); pass an empty
/// slice to receive every key once.
pub fn poll_keys(kv: &Kv, keys: &[Key], known: &[Option<String>]) -> CResult<KeySetDelta> {
    let entries = kv.get_many(keys)?;
    let mut changed = Vec::new();
    let mut stamps = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        stamps.push(entry.versionstamp.clone());
        let last = known.get(i).cloned().unwrap_or(None);
        if entry.versionstamp != last {
            changed.push(entry);
        }
    }
    Ok(KeySetDelta { changed, stamps })
}

/// Compares the current listing under `prefix` against the previous
/// `snapshot`. Keys present before and absent now come back as null entries,
/// exactly once per disappearance.
pub fn poll_prefix(
    kv: &Kv,
    prefix: &Key,
    limit: Option<u32>,
    snapshot: &BTreeMap<String, String>,
) -> CResult<PrefixDelta> {
    let entries = kv.list(prefix, &ListOptions { limit, ..Default::default() })?;

    let mut new_snapshot = BTreeMap::new();
    let mut changed = Vec::new();
    for entry in entries {
        let hex_key = hex::encode(crate::codec::key::encode_key(&entry.key)?);
        let stamp = entry.versionstamp.clone().unwrap_or_default();
        if snapshot.get(&hex_key) != Some(&stamp) {
            changed.push(entry);
        }
        new_snapshot.insert(hex_key, stamp);
    }
    for hex_key in snapshot.keys() {
        if !new_snapshot.contains_key(hex_key) {
            let bytes = hex::decode(hex_key)
                .map_err(|e| crate::error::Error::CorruptKey(e.to_string()))?;
            changed.push(Entry::miss(crate::codec::key::decode_key(&bytes)?));
        }
    }
    Ok(PrefixDelta { changed, snapshot: new_snapshot })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::codec::key::KeyPart;
    use crate::store::SetOptions;

    fn kv() -> Kv {
        Kv::open_in_memory().unwrap()
    }

    fn key(parts: &[&str]) -> Key {
        parts.iter().map(|p| KeyPart::Text(p.to_string())).collect()
    }

    #[test]
    fn key_set_poll_reports_only_changes() {
        let kv = kv();
        let a = key(&["w", "a"]);
        let b = key(&["w", "b"]);
        kv.set(&a, &json!(1), SetOptions::default()).unwrap();

        // First poll with no known stamps: both keys reported once.
        let first = poll_keys(&kv, &[a.clone(), b.clone()], &[]).unwrap();
        assert_eq!(first.changed.len(), 2);
        assert!(first.stamps[0].is_some());
        assert_eq!(first.stamps[1], None);

        // Nothing changed: empty delta.
        let second = poll_keys(&kv, &[a.clone(), b.clone()], &first.stamps).unwrap();
        assert!(second.changed.is_empty());

        // One write: one delta.
        kv.set(&b, &json!(2), SetOptions::default()).unwrap();
        let third = poll_keys(&kv, &[a.clone(), b.clone()], &second.stamps).unwrap();
        assert_eq!(third.changed.len(), 1);
        assert_eq!(third.changed[0].key, b);
    }

    #[test]
    fn prefix_poll_reports_deletions_exactly_once() {
        let kv = kv();
        let a = key(&["p", "a"]);
        let b = key(&["p", "b"]);
        kv.set(&a, &json!(1), SetOptions::default()).unwrap();
        kv.set(&b, &json!(2), SetOptions::default()).unwrap();

        let first = poll_prefix(&kv, &key(&["p"]), None, &BTreeMap::new()).unwrap();
        assert_eq!(first.changed.len(), 2);

        kv.delete(&a, None).unwrap();
        let second = poll_prefix(&kv, &key(&["p"]), None, &first.snapshot).unwrap();
        assert_eq!(second.changed.len(), 1);
        assert_eq!(second.changed[0].key, a);
        assert!(!second.changed[0].exists());

        // The deletion is not reported again.
        let third = poll_prefix(&kv, &key(&["p"]), None, &second.snapshot).unwrap();
        assert!(third.changed.is_empty());
    }

    #[test]
    fn prefix_poll_sees_updates() {
        let kv = kv();
        let a = key(&["q", "a"]);
        kv.set(&a, &json!("v1"), SetOptions::default()).unwrap();
        let first = poll_prefix(&kv, &key(&["q"]), None, &BTreeMap::new()).unwrap();

        kv.set(&a, &json!("v2"), SetOptions::default()).unwrap();
        let second = poll_prefix(&kv, &key(&["q"]), None, &first.snapshot).unwrap();
        assert_eq!(second.changed.len(), 1);
        assert_eq!(second.changed[0].value, Some(json!("v2")));
    }
}
