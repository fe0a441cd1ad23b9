// ============================================================================
// Change Commands
// ============================================================================
//
// A flush turns the session's pending entries into Change commands. The store
// stages them per transaction and applies them on commit, or drops them on
// rollback.
//
// ============================================================================

use crate::core::EntityKey;
use serde_json::Value;

/// A single pending write produced by a session flush
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create a row that must not exist yet
    Insert { key: EntityKey, value: Value },

    /// Replace an existing row
    Update { key: EntityKey, value: Value },

    /// Remove an existing row
    Delete { key: EntityKey },
}

impl Change {
    /// Get the row key affected by this change
    pub fn key(&self) -> &EntityKey {
        match self {
            Change::Insert { key, .. } => key,
            Change::Update { key, .. } => key,
            Change::Delete { key } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Change::Insert { .. } => "insert",
            Change::Update { .. } => "update",
            Change::Delete { .. } => "delete",
        }
    }
}
