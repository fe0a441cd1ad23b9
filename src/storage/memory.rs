use super::PersistenceStore;
use crate::core::{DbError, EntityKey, Result};
use crate::transaction::{Change, TransactionId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};

/// In-memory store with per-transaction staging.
///
/// Writes are validated against the committed rows plus whatever the same
/// transaction staged earlier: inserting an existing key or touching a
/// missing one fails with [`DbError::Persistence`]. Commit validates again
/// against the rows committed in the meantime and then applies everything or
/// nothing.
pub struct MemoryStore {
    committed: RwLock<BTreeMap<EntityKey, Value>>,
    staged: Mutex<HashMap<TransactionId, Vec<Change>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(BTreeMap::new()),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store that already holds committed rows
    pub fn with_rows(rows: impl IntoIterator<Item = (EntityKey, Value)>) -> Self {
        Self {
            committed: RwLock::new(rows.into_iter().collect()),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Copy of every committed row
    pub async fn snapshot(&self) -> BTreeMap<EntityKey, Value> {
        self.committed.read().await.clone()
    }

    /// Number of committed rows
    pub async fn len(&self) -> usize {
        self.committed.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.committed.read().await.is_empty()
    }

    /// Number of transactions begun but neither committed nor rolled back
    pub async fn open_transactions(&self) -> usize {
        self.staged.lock().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks `changes` in order against `exists`, which answers for rows not yet
/// touched by the batch.
fn validate<'a>(
    changes: impl IntoIterator<Item = &'a Change>,
    exists: impl Fn(&EntityKey) -> bool,
) -> Result<()> {
    let mut overlay: HashMap<&EntityKey, bool> = HashMap::new();

    for change in changes {
        let key = change.key();
        let present = overlay.get(key).copied().unwrap_or_else(|| exists(key));

        match change {
            Change::Insert { .. } if present => {
                return Err(DbError::Persistence(format!("duplicate key {}", key)));
            }
            Change::Update { .. } | Change::Delete { .. } if !present => {
                return Err(DbError::Persistence(format!("row not found {}", key)));
            }
            _ => {}
        }

        overlay.insert(key, !matches!(change, Change::Delete { .. }));
    }

    Ok(())
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn begin(&self) -> Result<TransactionId> {
        let txn = TransactionId::new();
        self.staged.lock().await.insert(txn, Vec::new());
        Ok(txn)
    }

    async fn write(&self, txn: TransactionId, changes: Vec<Change>) -> Result<()> {
        let mut staged = self.staged.lock().await;
        let pending = staged
            .get_mut(&txn)
            .ok_or_else(|| DbError::Persistence(format!("{} is not open", txn)))?;

        let committed = self.committed.read().await;
        validate(pending.iter().chain(changes.iter()), |key| {
            committed.contains_key(key)
        })?;

        pending.extend(changes);
        Ok(())
    }

    async fn commit(&self, txn: TransactionId) -> Result<()> {
        let mut staged = self.staged.lock().await;
        let changes = staged
            .remove(&txn)
            .ok_or_else(|| DbError::Persistence(format!("{} is not open", txn)))?;

        let mut committed = self.committed.write().await;
        validate(changes.iter(), |key| committed.contains_key(key))?;

        for change in changes {
            match change {
                Change::Insert { key, value } | Change::Update { key, value } => {
                    committed.insert(key, value);
                }
                Change::Delete { key } => {
                    committed.remove(&key);
                }
            }
        }

        Ok(())
    }

    async fn rollback(&self, txn: TransactionId) -> Result<()> {
        self.staged.lock().await.remove(&txn);
        Ok(())
    }

    async fn fetch(&self, key: &EntityKey) -> Result<Option<Value>> {
        Ok(self.committed.read().await.get(key).cloned())
    }

    async fn scan(&self, collection: &str) -> Result<Vec<(EntityKey, Value)>> {
        let committed = self.committed.read().await;
        Ok(committed
            .iter()
            .filter(|(key, _)| key.collection == collection)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
