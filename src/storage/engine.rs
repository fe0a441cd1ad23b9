use crate::core::{EntityKey, Result};
use crate::transaction::{Change, TransactionId};
use async_trait::async_trait;
use serde_json::Value;

/// Persistence backend behind the session - allows pluggable stores
///
/// The session only ever drives one transaction at a time, but stores must be
/// shareable so the coordinator can hold them behind an `Arc`.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Open a new store transaction
    async fn begin(&self) -> Result<TransactionId>;

    /// Stage flushed changes inside an open transaction
    async fn write(&self, txn: TransactionId, changes: Vec<Change>) -> Result<()>;

    /// Make every staged change of `txn` visible atomically
    async fn commit(&self, txn: TransactionId) -> Result<()>;

    /// Discard the staged changes of `txn`. Unknown transactions are a no-op.
    async fn rollback(&self, txn: TransactionId) -> Result<()>;

    /// Read the committed state of one row
    async fn fetch(&self, key: &EntityKey) -> Result<Option<Value>>;

    /// Read every committed row of a collection, ordered by key
    async fn scan(&self, collection: &str) -> Result<Vec<(EntityKey, Value)>>;
}
