use crate::core::{DbError, Entity, EntityId, EntityKey, Result};
use crate::transaction::TransactionHandle;
use std::marker::PhantomData;

/// Generic CRUD over one entity type.
///
/// Every operation acts on the shared session through the transaction handle
/// it is given, so nothing is read or written without holding the lock.
/// Changes become visible to the store when that handle commits.
pub struct Repository<T: Entity> {
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    pub fn new() -> Self {
        Self {
            _entity: PhantomData,
        }
    }

    fn key(id: EntityId) -> EntityKey {
        EntityKey::new(T::COLLECTION, id)
    }

    pub async fn add(&self, tx: &TransactionHandle, entity: &T) -> Result<()> {
        let value = serde_json::to_value(entity)?;
        tx.session().await?.add(entity.key(), value)
    }

    pub async fn update(&self, tx: &TransactionHandle, entity: &T) -> Result<()> {
        let value = serde_json::to_value(entity)?;
        tx.session().await?.update(entity.key(), value)
    }

    /// Remove an entity. Soft-deletable entities are flagged and updated
    /// instead of being removed from the store.
    pub async fn remove(&self, tx: &TransactionHandle, mut entity: T) -> Result<()> {
        if entity.mark_deleted() {
            return self.update(tx, &entity).await;
        }

        tx.session().await?.remove(entity.key());
        Ok(())
    }

    pub async fn remove_by_id(&self, tx: &TransactionHandle, id: EntityId) -> Result<()> {
        let entity = self.get(tx, id).await?;
        self.remove(tx, entity).await
    }

    pub async fn find(&self, tx: &TransactionHandle, id: EntityId) -> Result<Option<T>> {
        let value = tx.session().await?.find(&Self::key(id)).await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Like [`find`](Self::find) but a missing entity is an error.
    pub async fn get(&self, tx: &TransactionHandle, id: EntityId) -> Result<T> {
        self.find(tx, id).await?.ok_or_else(|| DbError::NotFound {
            collection: T::COLLECTION.to_string(),
            id: id.to_string(),
        })
    }

    pub async fn exists(&self, tx: &TransactionHandle, id: EntityId) -> Result<bool> {
        Ok(tx.session().await?.find(&Self::key(id)).await?.is_some())
    }
}

impl<T: Entity> Default for Repository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}
