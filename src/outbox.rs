//! Transactional outbox.
//!
//! Outgoing messages are written into the same session as the business data,
//! so they commit or roll back together with it. Delivering committed messages
//! to a broker is left to a relay outside this crate; it reads them with
//! [`OutboxWriter::pending`] and removes them once delivered.

use crate::core::{EntityKey, Result};
use crate::storage::PersistenceStore;
use crate::transaction::TransactionHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Level, event};
use uuid::Uuid;

pub const OUTBOX_COLLECTION: &str = "outbox_messages";

/// A message contract that can be published through the outbox.
pub trait OutboxMessageType: Serialize {
    /// Routing name of the message, e.g. `"music-genre.added"`
    fn message_type(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub message_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(OUTBOX_COLLECTION, self.id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutboxWriter;

impl OutboxWriter {
    pub fn new() -> Self {
        Self
    }

    /// Stage `message` in the transaction's session.
    pub async fn publish<M: OutboxMessageType>(
        &self,
        tx: &TransactionHandle,
        message: &M,
    ) -> Result<OutboxMessage> {
        let record = OutboxMessage {
            id: Uuid::new_v4(),
            message_type: message.message_type().to_string(),
            payload: serde_json::to_value(message)?,
            created_at: Utc::now(),
        };

        tx.session()
            .await?
            .add(record.key(), serde_json::to_value(&record)?)?;
        event!(
            Level::DEBUG,
            txn = %tx.id(),
            message_id = %record.id,
            message_type = %record.message_type,
            "outbox message staged"
        );
        Ok(record)
    }

    /// Committed messages, oldest first.
    pub async fn pending(&self, store: &dyn PersistenceStore) -> Result<Vec<OutboxMessage>> {
        let mut messages = store
            .scan(OUTBOX_COLLECTION)
            .await?
            .into_iter()
            .map(|(_, value)| serde_json::from_value::<OutboxMessage>(value))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        messages.sort_by_key(|message| message.created_at);
        Ok(messages)
    }

    /// Drop a delivered message within `tx`.
    pub async fn acknowledge(&self, tx: &TransactionHandle, message_id: Uuid) -> Result<()> {
        tx.session()
            .await?
            .remove(EntityKey::new(OUTBOX_COLLECTION, message_id));
        Ok(())
    }
}
