// ============================================================================
// Transaction Handle
// ============================================================================
//
// Binds one lock token to one store transaction on the shared session. Every
// exit path (commit ok, commit error, rollback, drop) releases the token
// exactly once, and only after the session is back in a consistent state.
//
// ============================================================================

use super::{HandleState, LockToken, TransactionId, TransactionLock};
use crate::core::{DbError, Result};
use crate::session::Session;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{Instrument, Level, event, info_span};

/// The session every transaction works against, shared by all handles.
pub type SharedSession = Arc<Mutex<Session>>;

/// One active transaction against the shared session.
///
/// Obtained from [`TransactionFactory::create_transaction`](super::TransactionFactory::create_transaction).
/// End it with [`commit`](Self::commit) or [`rollback`](Self::rollback); a
/// handle dropped while still active is rolled back on the current tokio
/// runtime and the lock is released once that finishes.
pub struct TransactionHandle {
    id: TransactionId,
    token: LockToken,
    state: HandleState,
    session: SharedSession,
    lock: Arc<TransactionLock>,
}

impl TransactionHandle {
    pub(crate) fn new(
        id: TransactionId,
        token: LockToken,
        session: SharedSession,
        lock: Arc<TransactionLock>,
    ) -> Self {
        event!(Level::DEBUG, txn = %id, token = %token, "transaction started");
        Self {
            id,
            token,
            state: HandleState::Active,
            session,
            lock,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Access the shared session on behalf of this transaction.
    ///
    /// Only an active handle whose token is still the lock holder gets in.
    pub async fn session(&self) -> Result<MutexGuard<'_, Session>> {
        self.ensure_active("access the session of")?;
        self.ensure_owner()?;

        Ok(self.session.lock().await)
    }

    /// Flush pending session changes, commit the store transaction and release
    /// the lock.
    ///
    /// The lock is released whether or not flush and commit succeed. On error
    /// the store transaction is rolled back, the session reloaded, and the
    /// original error returned; the handle ends up [`HandleState::Failed`].
    /// Dropping the returned future before it completes leaves the handle
    /// active, so its drop still reverts and releases. A handle whose token is
    /// no longer the holder fails with [`DbError::InvalidOwner`] before
    /// anything is flushed.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        self.abandon_if_stale()?;

        let span = info_span!("transaction.commit", txn = %self.id);
        async {
            match self.flush_and_commit().await {
                // No await between a successful store commit and close, so a
                // dropped commit future never reverts committed work.
                Ok(()) => self.close(HandleState::Committed),
                Err(err) => {
                    if let Err(revert_err) = revert(&self.session, self.id).await {
                        event!(Level::ERROR, error = %revert_err, "failed to revert after commit error");
                    }
                    if let Err(release_err) = self.close(HandleState::Failed) {
                        event!(Level::ERROR, error = %release_err, "failed to release lock after commit error");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Roll back the store transaction, reload the session and release the
    /// lock. A closed handle is left alone; a handle whose token is no longer
    /// the holder fails with [`DbError::InvalidOwner`] and reverts nothing.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.abandon_if_stale()?;

        let span = info_span!("transaction.rollback", txn = %self.id);
        async {
            event!(Level::WARN, "transaction not committed, reverting");
            let reverted = revert(&self.session, self.id).await;
            let released = self.close(HandleState::RolledBack);
            reverted.and(released)
        }
        .instrument(span)
        .await
    }

    async fn flush_and_commit(&self) -> Result<()> {
        let mut session = self.session.lock().await;

        if let Err(err) = session.save_changes(self.id).await {
            event!(Level::ERROR, error = %err, "while saving the changes to the store, an error occurred");
            return Err(err);
        }
        event!(Level::DEBUG, "saved changes to transaction");

        if let Err(err) = session.store().commit(self.id).await {
            event!(Level::ERROR, error = %err, "failed to commit transaction");
            return Err(err);
        }
        event!(Level::DEBUG, "committed transaction");

        Ok(())
    }

    fn close(&mut self, outcome: HandleState) -> Result<()> {
        self.state = outcome;
        self.lock.release(self.token)
    }

    fn ensure_owner(&self) -> Result<()> {
        if self.lock.is_held_by(self.token) {
            return Ok(());
        }
        Err(DbError::InvalidOwner {
            current: self
                .lock
                .holder()
                .map(|token| token.to_string())
                .unwrap_or_else(|| "none".to_string()),
            requested: self.token.to_string(),
        })
    }

    /// A handle whose token was released behind its back must not touch the
    /// shared session again: it is closed as failed without flushing,
    /// reverting or releasing.
    fn abandon_if_stale(&mut self) -> Result<()> {
        if let Err(err) = self.ensure_owner() {
            event!(Level::ERROR, txn = %self.id, error = %err, "transaction no longer owns the lock");
            self.state = HandleState::Failed;
            return Err(err);
        }
        Ok(())
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if self.state.is_closed() {
            return Err(DbError::InvalidState(format!(
                "Cannot {} transaction {}: already {}",
                action, self.id, self.state
            )));
        }
        Ok(())
    }
}

/// Roll back `txn` in the store and bring the session back to the committed
/// state. Both steps always run; the first error is returned.
async fn revert(session: &SharedSession, txn: TransactionId) -> Result<()> {
    let mut session = session.lock().await;

    let rolled_back = session.store().rollback(txn).await;
    if let Err(err) = &rolled_back {
        event!(Level::ERROR, txn = %txn, error = %err, "store rollback failed");
    }

    let reloaded = session.reload_all().await;
    if let Err(err) = &reloaded {
        event!(Level::ERROR, txn = %txn, error = %err, "session reload failed, clearing tracked entries");
        session.clear();
    }

    rolled_back.and(reloaded)
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.state.is_closed() || self.abandon_if_stale().is_err() {
            return;
        }
        self.state = HandleState::RolledBack;
        event!(Level::WARN, txn = %self.id, "transaction dropped without commit, reverting");

        let session = Arc::clone(&self.session);
        let lock = Arc::clone(&self.lock);
        let (txn, token) = (self.id, self.token);
        let teardown = async move {
            // Errors are already logged by revert; the lock goes back regardless.
            let _ = revert(&session, txn).await;
            if let Err(err) = lock.release(token) {
                event!(Level::ERROR, txn = %txn, error = %err, "failed to release lock of dropped transaction");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(teardown);
            }
            Err(_) => futures::executor::block_on(teardown),
        }
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::core::EntityKey;
    use crate::storage::{MemoryStore, PersistenceStore};
    use serde_json::json;

    async fn open(store: Arc<MemoryStore>) -> (Arc<TransactionLock>, SharedSession, TransactionHandle) {
        let lock = Arc::new(TransactionLock::new(CoordinatorConfig::default()));
        let session: SharedSession = Arc::new(Mutex::new(Session::new(store.clone())));
        let token = lock.acquire().await.unwrap();
        let txn = store.begin().await.unwrap();
        let handle = TransactionHandle::new(txn, token, session.clone(), lock.clone());
        (lock, session, handle)
    }

    #[tokio::test]
    async fn test_commit_releases_lock_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let (lock, _session, mut handle) = open(store.clone()).await;

        handle
            .session()
            .await
            .unwrap()
            .add(EntityKey::new("items", 1), json!({ "id": 1 }))
            .unwrap();
        handle.commit().await.unwrap();

        assert_eq!(handle.state(), HandleState::Committed);
        assert!(!lock.is_locked());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.open_transactions().await, 0);
    }

    #[tokio::test]
    async fn test_second_commit_is_invalid_state() {
        let store = Arc::new(MemoryStore::new());
        let (lock, _session, mut handle) = open(store).await;
        handle.commit().await.unwrap();

        let again = handle.commit().await;

        assert!(matches!(again, Err(DbError::InvalidState(_))));
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_rollback_after_commit_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let (lock, _session, mut handle) = open(store).await;
        handle.commit().await.unwrap();

        let other = lock.acquire().await.unwrap();
        handle.rollback().await.unwrap();
        drop(handle);

        assert_eq!(lock.holder(), Some(other));
    }

    #[tokio::test]
    async fn test_failed_commit_releases_and_reverts() {
        let store = Arc::new(MemoryStore::with_rows([(
            EntityKey::new("items", 1),
            json!({ "id": 1 }),
        )]));
        let (lock, session, mut handle) = open(store.clone()).await;

        handle
            .session()
            .await
            .unwrap()
            .add(EntityKey::new("items", 1), json!({ "id": 1, "dup": true }))
            .unwrap();
        let err = handle.commit().await.unwrap_err();

        assert!(err.is_persistence());
        assert_eq!(handle.state(), HandleState::Failed);
        assert!(!lock.is_locked());
        assert!(!session.lock().await.has_changes());
        assert_eq!(store.open_transactions().await, 0);
    }

    #[tokio::test]
    async fn test_session_access_closed_after_commit() {
        let store = Arc::new(MemoryStore::new());
        let (_lock, _session, mut handle) = open(store).await;
        handle.commit().await.unwrap();

        assert!(matches!(
            handle.session().await,
            Err(DbError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_rollback_discards_changes() {
        let store = Arc::new(MemoryStore::new());
        let (lock, session, mut handle) = open(store.clone()).await;
        handle
            .session()
            .await
            .unwrap()
            .add(EntityKey::new("items", 1), json!({}))
            .unwrap();

        handle.rollback().await.unwrap();

        assert_eq!(handle.state(), HandleState::RolledBack);
        assert!(!lock.is_locked());
        assert_eq!(session.lock().await.tracked_len(), 0);
        assert!(store.is_empty().await);
        assert_eq!(store.open_transactions().await, 0);
    }

    async fn add_item(handle: &TransactionHandle, id: i64) {
        handle
            .session()
            .await
            .unwrap()
            .add(EntityKey::new("items", id), json!({ "id": id }))
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_handle_commit_flushes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (lock, session, mut stale) = open(store.clone()).await;
        add_item(&stale, 1).await;
        lock.release(stale.token()).unwrap();

        let owner = lock.acquire().await.unwrap();
        let err = stale.commit().await.unwrap_err();

        assert!(matches!(err, DbError::InvalidOwner { .. }));
        assert_eq!(stale.state(), HandleState::Failed);
        assert!(store.is_empty().await);
        assert_eq!(lock.holder(), Some(owner));
        assert!(session.lock().await.has_changes());
    }

    #[tokio::test]
    async fn test_stale_handle_rollback_and_drop_leave_session_alone() {
        let store = Arc::new(MemoryStore::new());
        let (lock, session, mut stale) = open(store.clone()).await;
        lock.release(stale.token()).unwrap();
        let owner = lock.acquire().await.unwrap();
        let current = TransactionHandle::new(
            store.begin().await.unwrap(),
            owner,
            session.clone(),
            lock.clone(),
        );
        add_item(&current, 2).await;

        assert!(matches!(
            stale.rollback().await,
            Err(DbError::InvalidOwner { .. })
        ));
        assert_eq!(stale.state(), HandleState::Failed);

        let abandoned = TransactionHandle::new(
            store.begin().await.unwrap(),
            LockToken::new(),
            session.clone(),
            lock.clone(),
        );
        drop(abandoned);
        tokio::task::yield_now().await;

        assert_eq!(lock.holder(), Some(owner));
        assert!(current.is_active());
        assert_eq!(session.lock().await.tracked_len(), 1);
    }

    #[test]
    fn test_drop_outside_runtime_still_releases() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (lock, session, handle) = runtime.block_on(open(store.clone()));
        runtime
            .block_on(handle.session())
            .unwrap()
            .add(EntityKey::new("items", 1), json!({}))
            .unwrap();

        drop(handle);

        assert!(!lock.is_locked());
        assert_eq!(runtime.block_on(session.lock()).tracked_len(), 0);
        assert_eq!(runtime.block_on(store.open_transactions()), 0);
    }
}
