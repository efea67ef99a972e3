use serde::{Deserialize, Serialize};

fn default_write_lock_wait_ms() -> u64 {
    100
}

/// Configuration of the SQL indexing subsystem.
///
/// Loaded from the `[indexing]` section of osprey.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Initial bounded wait for the table index write lock, in milliseconds.
    /// The wait is doubled on every retry so a snapshot installer cannot be
    /// starved by a stream of updates.
    #[serde(default = "default_write_lock_wait_ms")]
    pub write_lock_wait_ms: u64,
    /// Release the table lock with parking_lot's fair unlock so queued
    /// snapshot installers get the lock in arrival order.
    #[serde(default)]
    pub fair_unlock: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            write_lock_wait_ms: default_write_lock_wait_ms(),
            fair_unlock: false,
        }
    }
}
