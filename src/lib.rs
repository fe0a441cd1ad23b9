//! Exclusive transaction coordination over a shared unit-of-work session.
//!
//! Every write goes through [`TransactionFactory::create_transaction`], which
//! waits for the single-slot [`TransactionLock`] and hands out a
//! [`TransactionHandle`]. Repositories and the outbox writer act on the shared
//! [`Session`] only through that handle; commit, rollback or drop release the
//! lock exactly once.
//!
//! ```
//! use serialtx::{Entity, EntityId, MemoryStore, Repository, TransactionFactory};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Genre {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl Entity for Genre {
//!     const COLLECTION: &'static str = "genres";
//!
//!     fn id(&self) -> EntityId {
//!         self.id
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> serialtx::Result<()> {
//! let factory = TransactionFactory::with_defaults(Arc::new(MemoryStore::new()));
//! let genres = Repository::<Genre>::new();
//!
//! let mut tx = factory.create_transaction().await?;
//! genres.add(&tx, &Genre { id: 1, name: "Jazz".into() }).await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod outbox;
pub mod prelude;
pub mod repository;
pub mod seed;
pub mod session;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use config::{CoordinatorConfig, CoordinatorSettings};
pub use core::{DbError, Entity, EntityId, EntityKey, Result};
pub use outbox::{OutboxMessage, OutboxMessageType, OutboxWriter};
pub use repository::Repository;
pub use seed::{SeedManager, Seeder};
pub use session::{EntryState, Session};
pub use storage::{MemoryStore, PersistenceStore};
pub use transaction::{
    HandleState, LockToken, TransactionFactory, TransactionHandle, TransactionId, TransactionLock,
};
