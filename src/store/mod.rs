//! Durable key→string storage for the backlog
//!
//! The backlog persists exactly two values: the encrypted sessions document
//! and the encrypted requests document. [`PersistentStore`] is the seam for
//! host applications that already have a preferences store; [`SqliteStore`]
//! is the default on-disk implementation and [`MemoryStore`] backs tests and
//! ephemeral embedding.
//!
//! The backlog is the only writer. A missing key means "no backlog yet" and
//! is not an error.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;

/// Key under which the encrypted sessions document is stored.
///
/// Legacy preference key; changing it would orphan persisted backlogs.
pub const SESSIONS_KEY: &str = "DATASPIN_OFFLINE_SESSIONS";

/// Key under which the encrypted requests document is stored.
pub const REQUESTS_KEY: &str = "DATASPIN_OFFLINE_REQUESTS";

/// A durable key→string mapping surviving process restarts.
pub trait PersistentStore: Send {
    /// Read a value; `None` when the key has never been written
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Remove a key; removing an absent key is not an error
    fn delete(&mut self, key: &str) -> Result<()>;

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}
