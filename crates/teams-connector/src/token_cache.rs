use std::collections::HashMap;
use std::sync::Mutex;

use crate::credentials::{BearerToken, now_epoch_seconds};

/// In-memory token cache with passive expiry: a read at or past the
/// token's expiry instant behaves as a miss. Entries are replaced
/// wholesale by [`TokenCache::set`]; there is no background eviction.
///
/// Concurrent cold-cache callers may each fetch and overwrite the same
/// key. Tokens are idempotent, so the last writer wins.
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, BearerToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_get(&self, key: &str) -> Option<BearerToken> {
        let now = now_epoch_seconds();
        self.entries
            .lock()
            .expect("token cache poisoned")
            .get(key)
            .filter(|token| !token.is_expired(now))
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, token: BearerToken) {
        self.entries
            .lock()
            .expect("token cache poisoned")
            .insert(key.into(), token);
    }
}
