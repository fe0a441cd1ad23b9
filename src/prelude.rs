//! Everything application code usually needs in one import.
//!
//! ```
//! use serialtx::prelude::*;
//! ```

pub use crate::core::{DbError, Entity, EntityId, EntityKey, Result};
pub use crate::outbox::{OutboxMessageType, OutboxWriter};
pub use crate::repository::Repository;
pub use crate::transaction::{TransactionFactory, TransactionHandle};
