use crate::core::{EntityKey, Result};
use crate::transaction::TransactionFactory;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{Level, event};

/// Supplies initial rows, e.g. reference data or test fixtures.
#[async_trait]
pub trait Seeder: Send + Sync {
    fn name(&self) -> &str;

    async fn seed(&self) -> Result<Vec<(EntityKey, Value)>>;
}

/// Inserts the rows of every registered seeder in a single transaction.
pub struct SeedManager {
    factory: TransactionFactory,
    seeders: Vec<Box<dyn Seeder>>,
}

impl SeedManager {
    pub fn new(factory: TransactionFactory) -> Self {
        Self {
            factory,
            seeders: Vec::new(),
        }
    }

    pub fn with_seeder(mut self, seeder: impl Seeder + 'static) -> Self {
        self.seeders.push(Box::new(seeder));
        self
    }

    /// Seed everything or nothing. Returns the number of inserted rows.
    pub async fn seed_all(&self) -> Result<usize> {
        let mut tx = self.factory.create_transaction().await?;
        let mut total = 0usize;

        for seeder in &self.seeders {
            let rows = seeder.seed().await?;
            let count = rows.len();
            let mut session = tx.session().await?;
            for (key, value) in rows {
                session.add(key, value)?;
            }
            event!(Level::DEBUG, seeder = seeder.name(), rows = count, "seeder staged rows");
            total += count;
        }

        tx.commit().await?;
        event!(Level::INFO, rows = total, seeders = self.seeders.len(), "seed data committed");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbError;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    struct Genres;

    #[async_trait]
    impl Seeder for Genres {
        fn name(&self) -> &str {
            "genres"
        }

        async fn seed(&self) -> Result<Vec<(EntityKey, Value)>> {
            Ok(vec![
                (EntityKey::new("genres", 1), json!({ "id": 1, "name": "Jazz" })),
                (EntityKey::new("genres", 2), json!({ "id": 2, "name": "Blues" })),
            ])
        }
    }

    struct Broken;

    #[async_trait]
    impl Seeder for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn seed(&self) -> Result<Vec<(EntityKey, Value)>> {
            Err(DbError::Persistence("fixture file missing".into()))
        }
    }

    #[tokio::test]
    async fn test_seed_all_commits_every_seeder() {
        let store = Arc::new(MemoryStore::new());
        let manager = SeedManager::new(TransactionFactory::with_defaults(store.clone()))
            .with_seeder(Genres);

        assert_eq!(manager.seed_all().await.unwrap(), 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_failing_seeder_leaves_store_untouched() {
        let store = Arc::new(MemoryStore::new());
        let factory = TransactionFactory::with_defaults(store.clone());
        let manager = SeedManager::new(factory.clone())
            .with_seeder(Genres)
            .with_seeder(Broken);

        assert!(manager.seed_all().await.is_err());

        // The abandoned handle reverts before the lock is handed on.
        let tx = factory.create_transaction().await.unwrap();
        assert_eq!(tx.session().await.unwrap().tracked_len(), 0);
        assert!(store.is_empty().await);
    }
}
