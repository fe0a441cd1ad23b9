// ============================================================================
// Transaction State Management
// ============================================================================
//
// A handle moves through exactly one transition: Active -> Closed.
// Closed carries the outcome (Committed, RolledBack, Failed); the lock does
// not distinguish between them, all three mean the token has been released.
//
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an underlying store transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Lifecycle of a [`TransactionHandle`](super::TransactionHandle)
///
/// ```text
/// Active ──commit ok──────> Committed
///   │ ────commit error────> Failed
///   └─────rollback/drop───> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Holds the lock token, store transaction open
    Active,

    /// Flush and commit succeeded
    Committed,

    /// Discarded through rollback or scope exit
    RolledBack,

    /// Flush or commit raised an error
    Failed,
}

impl HandleState {
    /// Check if the handle still holds the lock
    pub fn is_active(&self) -> bool {
        matches!(self, HandleState::Active)
    }

    /// Check if the handle reached a terminal state
    pub fn is_closed(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleState::Active => write!(f, "ACTIVE"),
            HandleState::Committed => write!(f, "COMMITTED"),
            HandleState::RolledBack => write!(f, "ROLLED BACK"),
            HandleState::Failed => write!(f, "FAILED"),
        }
    }
}
