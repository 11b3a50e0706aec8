//! Broadcast watermark
//!
//! The broadcast slot is never cleared, so every subscription replays the
//! last broadcast. A device executes a broadcast only when its timestamp is
//! strictly newer than the highest one it already claimed.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::Result;
use crate::db::WatermarkRepo;

/// Watermark channel name for the broadcast slot
pub const BROADCAST_CHANNEL: &str = "broadcast";

/// Nothing claimed yet
const UNSET: i64 = i64::MIN;

/// Highest broadcast timestamp claimed by one device
pub struct Watermark {
    device_id: String,
    current: AtomicI64,
    repo: Option<WatermarkRepo>,
}

impl std::fmt::Debug for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watermark")
            .field("device_id", &self.device_id)
            .field("current", &self.get())
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

impl Watermark {
    /// Watermark kept only for the lifetime of the process
    #[must_use]
    pub fn in_memory(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            current: AtomicI64::new(UNSET),
            repo: None,
        }
    }

    /// Watermark restored from and persisted to the local database
    ///
    /// # Errors
    ///
    /// Returns error if the stored value cannot be read
    pub fn load(device_id: &str, repo: WatermarkRepo) -> Result<Self> {
        let stored = repo.get(device_id, BROADCAST_CHANNEL)?;
        if let Some(ts) = stored {
            tracing::debug!(device_id, issued_at = ts, "restored broadcast watermark");
        }
        Ok(Self {
            device_id: device_id.to_string(),
            current: AtomicI64::new(stored.unwrap_or(UNSET)),
            repo: Some(repo),
        })
    }

    /// Highest claimed timestamp, if any
    #[must_use]
    pub fn get(&self) -> Option<i64> {
        let ts = self.current.load(Ordering::SeqCst);
        (ts != UNSET).then_some(ts)
    }

    /// Claim `issued_at` for execution
    ///
    /// Returns true exactly once per timestamp newer than the current
    /// watermark, even when two deliveries race.
    pub fn try_claim(&self, issued_at: i64) -> bool {
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (issued_at > current).then_some(issued_at)
            })
            .is_ok()
    }

    /// Record `issued_at` as executed in the database, if any
    ///
    /// Called after the broadcast ran, so a crash mid-execution leaves the
    /// stored watermark behind and the broadcast runs again after restart.
    /// The stored value never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn persist(&self, issued_at: i64) -> Result<()> {
        let Some(repo) = &self.repo else {
            return Ok(());
        };
        repo.advance(&self.device_id, BROADCAST_CHANNEL, issued_at)
    }

    /// Whether claims survive a restart
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.repo.is_some()
    }
}
