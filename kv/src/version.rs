//! Versionstamp source.
//!
//! Every successful commit is stamped with an opaque, lexicographically
//! ordered identifier: 10 bytes rendered as 20 lowercase hex characters,
//! a 6-byte unix-millisecond timestamp followed by 4 random bytes (the
//! time-ordered UUID layout, truncated). Fixed width makes string order
//! equal numeric order.
//!
//! Within one source the stamps are forced strictly monotonic: when the
//! clock has not advanced past the last issued stamp, the next stamp is
//! `last + 1`. All mutations of one atomic commit share a single stamp.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Number of hex characters in a rendered versionstamp.
pub const VERSIONSTAMP_LEN: usize = 20;

/// Monotonic stamp issuer, shared by everything that commits.
#[derive(Clone)]
pub struct VersionstampSource {
    last: Arc<Mutex<u128>>,
}

impl VersionstampSource {
    pub fn new() -> Self {
        Self { last: Arc::new(Mutex::new(0)) }
    }

    /// Issues the next stamp. Strictly greater than every stamp issued
    /// before it by this source.
    pub fn next(&self) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let random: u32 = rand::thread_rng().gen();
        let candidate = ((now_ms as u128) << 32) | random as u128;

        let mut last = self.last.lock().expect("versionstamp lock poisoned");
        let stamp = if candidate > *last { candidate } else { *last + 1 };
        *last = stamp;
        format!("{:020x}", stamp)
    }
}

impl Default for VersionstampSource {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `stamp` looks like something [`VersionstampSource::next`]
/// produced. Used to validate check inputs from the wire.
pub fn is_valid_versionstamp(stamp: &str) -> bool {
    stamp.len() == VERSIONSTAMP_LEN && stamp.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
