use super::{LockToken, SharedSession, TransactionHandle, TransactionLock};
use crate::config::CoordinatorConfig;
use crate::core::Result;
use crate::session::Session;
use crate::storage::PersistenceStore;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Entry point for obtaining transactions on the shared session.
///
/// Cloning is cheap; clones share the same lock and session.
#[derive(Clone)]
pub struct TransactionFactory {
    lock: Arc<TransactionLock>,
    session: SharedSession,
    store: Arc<dyn PersistenceStore>,
}

impl TransactionFactory {
    pub fn new(store: Arc<dyn PersistenceStore>, config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            lock: Arc::new(TransactionLock::new(config)),
            session: Arc::new(Mutex::new(Session::new(Arc::clone(&store)))),
            store,
        })
    }

    pub fn with_defaults(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            lock: Arc::new(TransactionLock::default()),
            session: Arc::new(Mutex::new(Session::new(Arc::clone(&store)))),
            store,
        }
    }

    pub fn lock(&self) -> &Arc<TransactionLock> {
        &self.lock
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    /// Wait for the lock, then open a store transaction bound to the new token.
    ///
    /// Fails with [`DbError::LockTimeout`](crate::DbError::LockTimeout) when the
    /// lock is not free within the configured budget. Does not retry.
    pub async fn create_transaction(&self) -> Result<TransactionHandle> {
        let token = self.lock.acquire().await?;
        let pending = PendingToken::new(&self.lock, token);

        let txn = match self.store.begin().await {
            Ok(txn) => txn,
            Err(err) => {
                event!(Level::ERROR, error = %err, "failed to begin store transaction");
                return Err(err);
            }
        };

        Ok(TransactionHandle::new(
            txn,
            pending.into_token(),
            Arc::clone(&self.session),
            Arc::clone(&self.lock),
        ))
    }

    /// Run `op` inside a fresh transaction.
    ///
    /// Commits when `op` returns `Ok`, rolls back when it returns `Err`.
    ///
    /// ```ignore
    /// factory
    ///     .with_transaction(|tx| Box::pin(async move {
    ///         genres.add(tx, &genre).await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a TransactionHandle) -> BoxFuture<'a, Result<T>>,
    {
        let mut tx = self.create_transaction().await?;

        match op(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    event!(Level::ERROR, error = %rollback_err, "rollback after failed operation failed");
                }
                Err(err)
            }
        }
    }
}

/// Hands the token back to the lock unless it made it into a handle, so a
/// cancelled or failed `create_transaction` never leaks the lock.
struct PendingToken<'a> {
    lock: &'a TransactionLock,
    token: LockToken,
    armed: bool,
}

impl<'a> PendingToken<'a> {
    fn new(lock: &'a TransactionLock, token: LockToken) -> Self {
        Self {
            lock,
            token,
            armed: true,
        }
    }

    fn into_token(mut self) -> LockToken {
        self.armed = false;
        self.token
    }
}

impl Drop for PendingToken<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.lock.release(self.token) {
                event!(Level::ERROR, error = %err, "failed to release lock of abandoned transaction");
            }
        }
    }
}
