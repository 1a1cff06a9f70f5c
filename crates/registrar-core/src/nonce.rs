//! Server nonce store with replay rejection

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;

/// Validity window for an issued nonce.
const NONCE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct NonceEntry {
    issued: Instant,
    used: bool,
}

/// Outcome of checking a client-presented nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    /// Fresh, ours, and unused until now.
    Valid,
    /// Expired, replayed, or never issued: re-challenge with `stale=true`.
    Stale,
}

/// Tracks outstanding digest nonces. Each nonce is single-use: the first
/// successful check consumes it, so a captured Authorization header cannot
/// be replayed.
#[derive(Debug, Default)]
pub struct NonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
}

impl NonceStore {
    pub fn new() -> Self {
        NonceStore::default()
    }

    /// Issue a fresh opaque nonce.
    pub fn issue(&self) -> String {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let nonce: String = raw.iter().map(|b| format!("{b:02x}")).collect();

        let mut entries = self.entries.lock();
        // Opportunistic purge keeps the map bounded without a sweeper task.
        entries.retain(|_, e| e.issued.elapsed() < NONCE_TTL);
        entries.insert(
            nonce.clone(),
            NonceEntry {
                issued: Instant::now(),
                used: false,
            },
        );
        nonce
    }

    /// Check and consume a nonce presented in credentials.
    pub fn check_and_consume(&self, nonce: &str) -> NonceCheck {
        let mut entries = self.entries.lock();
        match entries.get_mut(nonce) {
            Some(entry) if entry.issued.elapsed() < NONCE_TTL && !entry.used => {
                entry.used = true;
                NonceCheck::Valid
            }
            Some(_) => NonceCheck::Stale,
            None => NonceCheck::Stale,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_nonce_validates_once() {
        let store = NonceStore::new();
        let nonce = store.issue();
        assert_eq!(store.check_and_consume(&nonce), NonceCheck::Valid);
        assert_eq!(store.check_and_consume(&nonce), NonceCheck::Stale);
    }

    #[test]
    fn unknown_nonce_is_stale() {
        let store = NonceStore::new();
        assert_eq!(store.check_and_consume("deadbeef"), NonceCheck::Stale);
    }

    #[test]
    fn nonces_are_unique() {
        let store = NonceStore::new();
        let a = store.issue();
        let b = store.issue();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(store.len(), 2);
    }
}
