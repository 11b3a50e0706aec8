//! Targeted command redelivery guard

use std::time::Duration;

use mini_moka::sync::Cache;

/// Default dedup TTL (5 minutes)
const DEDUP_TTL_SECS: u64 = 300;

/// Maximum dedup cache entries
const DEDUP_MAX_ENTRIES: u64 = 256;

/// Short-lived record of targeted commands already executed
///
/// Covers the window where a handled command could not be cleared from its
/// slot and is replayed by the next subscription. Entries expire, so the
/// handler must still tolerate an occasional repeat.
#[derive(Clone)]
pub struct CommandDedup {
    seen: Cache<String, ()>,
}

impl Default for CommandDedup {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEDUP_TTL_SECS))
    }
}

impl std::fmt::Debug for CommandDedup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDedup")
            .field("entries", &self.seen.entry_count())
            .finish()
    }
}

impl CommandDedup {
    /// Create a cache whose entries live for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(DEDUP_MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Whether `key` was executed within the TTL
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains_key(&key.to_string())
    }

    /// Remember that `key` was executed
    pub fn insert(&self, key: String) {
        self.seen.insert(key, ());
    }
}
