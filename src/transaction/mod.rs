// ============================================================================
// Exclusive Transaction Coordination
// ============================================================================
//
// All write transactions go through one lock with capacity one, so the shared
// session only ever serves a single transaction at a time:
//
//   TransactionFactory ──acquire──> TransactionLock ──token──> TransactionHandle
//                                                           (commit / rollback / drop
//                                                            release the token once)
//
// ============================================================================

pub mod change;
pub mod factory;
pub mod handle;
pub mod lock;
pub mod state;

pub use change::Change;
pub use factory::TransactionFactory;
pub use handle::{SharedSession, TransactionHandle};
pub use lock::{LockToken, TransactionLock};
pub use state::{HandleState, TransactionId};
