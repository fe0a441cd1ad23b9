// ============================================================================
// Unit-of-Work Session
// ============================================================================
//
// The shared, non-reentrant session every repository works against. It keeps
// an in-memory change tracker over a PersistenceStore: mutations stay pending
// until a flush turns them into Change commands inside the store transaction
// of the current handle.
//
// The session is not safe for concurrent transactions. The coordinator keeps
// it behind a mutex and only an Active TransactionHandle hands out guards.
//
// ============================================================================

use crate::core::{DbError, EntityKey, Result};
use crate::storage::PersistenceStore;
use crate::transaction::{Change, TransactionId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// New row, never persisted
    Added,
    /// Persisted row with pending modifications
    Modified,
    /// Persisted row scheduled for removal
    Deleted,
    /// In sync with the store
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub state: EntryState,
    /// Value as the application last set it; `None` for rows removed before
    /// they were ever loaded
    pub current: Option<Value>,
    /// Last known persisted value
    pub original: Option<Value>,
}

pub struct Session {
    store: Arc<dyn PersistenceStore>,
    entries: BTreeMap<EntityKey, TrackedEntry>,
}

impl Session {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            store,
            entries: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    /// Start tracking a new row.
    ///
    /// A row that is tracked as deleted is revived as a modification.
    pub fn add(&mut self, key: EntityKey, value: Value) -> Result<()> {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.state == EntryState::Deleted => {
                entry.current = Some(value);
                entry.state = EntryState::Modified;
                Ok(())
            }
            Some(_) => Err(DbError::AlreadyTracked(key.to_string())),
            None => {
                self.entries.insert(
                    key,
                    TrackedEntry {
                        state: EntryState::Added,
                        current: Some(value),
                        original: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// Record a new value for a row. Untracked rows are attached as modified.
    pub fn update(&mut self, key: EntityKey, value: Value) -> Result<()> {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.state == EntryState::Deleted => Err(DbError::InvalidState(
                format!("Entity '{}' is scheduled for deletion", key),
            )),
            Some(entry) => {
                entry.current = Some(value);
                if entry.state == EntryState::Unchanged {
                    entry.state = EntryState::Modified;
                }
                Ok(())
            }
            None => {
                self.entries.insert(
                    key,
                    TrackedEntry {
                        state: EntryState::Modified,
                        current: Some(value),
                        original: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// Schedule a row for removal. Rows added in this unit of work are simply
    /// forgotten.
    pub fn remove(&mut self, key: EntityKey) {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.state != EntryState::Added => {
                entry.state = EntryState::Deleted;
            }
            Some(_) => {
                self.entries.remove(&key);
            }
            None => {
                self.entries.insert(
                    key,
                    TrackedEntry {
                        state: EntryState::Deleted,
                        current: None,
                        original: None,
                    },
                );
            }
        }
    }

    /// Look a row up, tracked state first, then the store. Rows loaded from
    /// the store start being tracked as unchanged.
    pub async fn find(&mut self, key: &EntityKey) -> Result<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(match entry.state {
                EntryState::Deleted => None,
                _ => entry.current.clone(),
            });
        }

        let persisted = self.store.fetch(key).await?;
        if let Some(value) = &persisted {
            self.entries.insert(
                key.clone(),
                TrackedEntry {
                    state: EntryState::Unchanged,
                    current: Some(value.clone()),
                    original: Some(value.clone()),
                },
            );
        }
        Ok(persisted)
    }

    pub fn entry(&self, key: &EntityKey) -> Option<&TrackedEntry> {
        self.entries.get(key)
    }

    pub fn state_of(&self, key: &EntityKey) -> Option<EntryState> {
        self.entries.get(key).map(|entry| entry.state)
    }

    pub fn tracked_len(&self) -> usize {
        self.entries.len()
    }

    pub fn has_changes(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.state != EntryState::Unchanged)
    }

    /// Pending mutations as store commands, in key order
    pub fn pending_changes(&self) -> Vec<Change> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| {
                let key = key.clone();
                match (entry.state, &entry.current) {
                    (EntryState::Added, Some(value)) => Some(Change::Insert {
                        key,
                        value: value.clone(),
                    }),
                    (EntryState::Modified, Some(value)) => Some(Change::Update {
                        key,
                        value: value.clone(),
                    }),
                    (EntryState::Deleted, _) => Some(Change::Delete { key }),
                    _ => None,
                }
            })
            .collect()
    }

    /// Flush pending mutations into `txn` and accept them.
    ///
    /// On error nothing is accepted; the pending state stays as it was.
    pub async fn save_changes(&mut self, txn: TransactionId) -> Result<usize> {
        let changes = self.pending_changes();
        let count = changes.len();
        if count == 0 {
            return Ok(0);
        }

        self.store.write(txn, changes).await?;
        self.accept_changes();
        event!(Level::DEBUG, txn = %txn, changes = count, "flushed session changes");
        Ok(count)
    }

    fn accept_changes(&mut self) {
        self.entries
            .retain(|_, entry| entry.state != EntryState::Deleted);
        for entry in self.entries.values_mut() {
            entry.state = EntryState::Unchanged;
            entry.original = entry.current.clone();
        }
    }

    /// Re-synchronize every tracked row with the store's committed state,
    /// discarding uncommitted mutations. Rows that were never committed are
    /// detached.
    pub async fn reload_all(&mut self) -> Result<()> {
        let keys: Vec<EntityKey> = self.entries.keys().cloned().collect();
        let mut detached = 0usize;

        for key in keys {
            match self.store.fetch(&key).await? {
                Some(value) => {
                    self.entries.insert(
                        key,
                        TrackedEntry {
                            state: EntryState::Unchanged,
                            current: Some(value.clone()),
                            original: Some(value),
                        },
                    );
                }
                None => {
                    self.entries.remove(&key);
                    detached += 1;
                }
            }
        }

        event!(
            Level::INFO,
            tracked = self.entries.len(),
            detached,
            "session entries reloaded from store"
        );
        Ok(())
    }

    /// Forget every tracked row without touching the store.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
