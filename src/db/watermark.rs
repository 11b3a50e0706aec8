//! Watermark repository for broadcast replay suppression

use rusqlite::OptionalExtension;

use super::DbPool;
use crate::{Error, Result};

/// Persists the newest executed command timestamp per device and channel
#[derive(Clone)]
pub struct WatermarkRepo {
    pool: DbPool,
}

impl WatermarkRepo {
    /// Create a new watermark repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Load the stored watermark
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, device_id: &str, channel: &str) -> Result<Option<i64>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        let issued_at = conn
            .query_row(
                "SELECT issued_at FROM watermarks WHERE device_id = ?1 AND channel = ?2",
                [device_id, channel],
                |row| row.get(0),
            )
            .optional()?;

        Ok(issued_at)
    }

    /// Store a watermark, never moving an existing one backwards
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn advance(&self, device_id: &str, channel: &str, issued_at: i64) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            r"
            INSERT INTO watermarks (device_id, channel, issued_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (device_id, channel) DO UPDATE SET
                issued_at = max(watermarks.issued_at, excluded.issued_at),
                updated_at = datetime('now')
            ",
            rusqlite::params![device_id, channel, issued_at],
        )?;

        tracing::debug!(device_id, channel, issued_at, "watermark persisted");
        Ok(())
    }
}
