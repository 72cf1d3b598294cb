//! In-process change triggers.
//!
//! A trigger subscribes a handler to a key prefix and a set of event kinds.
//! After a successful mutation the engine fans the event out to every
//! subscriber whose prefix contains the key and whose kind set contains the
//! operation. Handlers are values owned by the registry; a failing handler
//! is logged and counted, never surfaced to the mutating caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::warn;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::key::{Key, SEP};
use crate::error::CResult;

/// The mutation kinds a trigger can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Set,
    Delete,
}

/// One change notification. `value` is `None` for deletes.
#[derive(Clone, Debug, Serialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub key: Key,
    pub value: Option<Value>,
    pub versionstamp: Option<String>,
}

/// Handler capability: a single-method value owned by the registry.
pub type TriggerHandler = Box<dyn Fn(&ChangeEvent) -> CResult<()> + Send + Sync>;

/// Opaque subscription handle, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TriggerId(u64);

struct Subscription {
    id: TriggerId,
    prefix: Vec<u8>,
    kinds: Vec<EventKind>,
    handler: TriggerHandler,
}

/// Registry of trigger subscriptions. Safe for concurrent reads during
/// dispatch and rare writes at (un)registration.
#[derive(Clone)]
pub struct TriggerRegistry {
    subs: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self {
            subs: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers a handler for mutations under `prefix` (encoded key bytes)
    /// matching any of `kinds`. Returns the handle used to unregister.
    pub fn on(&self, prefix: Vec<u8>, kinds: Vec<EventKind>, handler: TriggerHandler) -> TriggerId {
        let id = TriggerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subs.write().expect("trigger registry poisoned");
        subs.push(Subscription { id, prefix, kinds, handler });
        id
    }

    /// Unregisters a subscription. Unknown handles are a no-op.
    pub fn off(&self, id: TriggerId) {
        let mut subs = self.subs.write().expect("trigger registry poisoned");
        subs.retain(|s| s.id != id);
    }

    /// Fans one event out to every matching subscriber, in registration
    /// order. Runs on the caller's context; handler failures are swallowed.
    pub fn dispatch(&self, event: &ChangeEvent, key_bytes: &[u8]) {
        let subs = self.subs.read().expect("trigger registry poisoned");
        for sub in subs.iter() {
            if !sub.kinds.contains(&event.kind) {
                continue;
            }
            if !prefix_contains(&sub.prefix, key_bytes) {
                continue;
            }
            if let Err(err) = (sub.handler)(event) {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "trigger handler {} failed on {:?} event: {}",
                    sub.id.0, event.kind, err
                );
            }
        }
    }

    /// Number of handler invocations that returned an error.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.subs.read().expect("trigger registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// True when the encoded `prefix` is equal to or a proper prefix of the
/// encoded `key`, respecting part boundaries.
pub fn prefix_contains(prefix: &[u8], key: &[u8]) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if key == prefix {
        return true;
    }
    key.len() > prefix.len() && key.starts_with(prefix) && key[prefix.len()] == SEP
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::codec::key::{encode_key, KeyPart};
    use crate::error::Error;

    fn enc(parts: &[&str]) -> Vec<u8> {
        let key: Key = parts.iter().map(|p| KeyPart::Text(p.to_string())).collect();
        encode_key(&key).unwrap()
    }

    fn event(kind: EventKind, parts: &[&str]) -> (ChangeEvent, Vec<u8>) {
        let key: Key = parts.iter().map(|p| KeyPart::Text(p.to_string())).collect();
        let bytes = encode_key(&key).unwrap();
        (
            ChangeEvent { kind, key, value: None, versionstamp: None },
            bytes,
        )
    }

    #[test]
    fn prefix_matching_respects_part_boundaries() {
        assert!(prefix_contains(&enc(&["a"]), &enc(&["a"])));
        assert!(prefix_contains(&enc(&["a"]), &enc(&["a", "b"])));
        assert!(prefix_contains(&[], &enc(&["a"])));
        // "ab" starts with the bytes of "a" but is a different part.
        assert!(!prefix_contains(&enc(&["a"]), &enc(&["ab"])));
        assert!(!prefix_contains(&enc(&["a", "b"]), &enc(&["a"])));
    }

    #[test]
    fn dispatch_filters_by_prefix_and_kind() {
        let registry = TriggerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = hits.clone();
        registry.on(
            enc(&["users"]),
            vec![EventKind::Set],
            Box::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let (ev, key) = event(EventKind::Set, &["users", "1"]);
        registry.dispatch(&ev, &key);
        let (ev, key) = event(EventKind::Delete, &["users", "1"]);
        registry.dispatch(&ev, &key);
        let (ev, key) = event(EventKind::Set, &["orders", "1"]);
        registry.dispatch(&ev, &key);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let registry = TriggerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.on(
            vec![],
            vec![EventKind::Set],
            Box::new(|_| Err(Error::Handler("boom".into()))),
        );
        let counted = hits.clone();
        registry.on(
            vec![],
            vec![EventKind::Set],
            Box::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let (ev, key) = event(EventKind::Set, &["x"]);
        registry.dispatch(&ev, &key);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.failure_count(), 1);
    }

    #[test]
    fn off_removes_subscription() {
        let registry = TriggerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let id = registry.on(
            vec![],
            vec![EventKind::Set, EventKind::Delete],
            Box::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert_eq!(registry.len(), 1);
        registry.off(id);
        assert!(registry.is_empty());

        let (ev, key) = event(EventKind::Set, &["x"]);
        registry.dispatch(&ev, &key);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
