// ============================================================================
// Transaction Lock
// ============================================================================
//
// Single-slot mutual exclusion over the shared session. The slot is a
// one-permit semaphore; ownership is tracked separately as the token minted
// on acquisition, and only that token can give the permit back.
//
// ============================================================================

use crate::config::CoordinatorConfig;
use crate::core::{DbError, Result};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio::time::{Instant, sleep_until};
use tracing::{Level, event};
use uuid::Uuid;

/// Proof of current ownership of the transaction lock.
///
/// Ownership is decided by equality with the holder the lock recorded, so a
/// token is a capability: whoever presents the current one may release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Mint a random token. Only tokens returned by [`TransactionLock::acquire`]
    /// confer ownership.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct TransactionLock {
    semaphore: Semaphore,
    holder: Mutex<Option<LockToken>>,
    config: CoordinatorConfig,
}

impl TransactionLock {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            semaphore: Semaphore::new(1),
            holder: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Wait for the lock and return a fresh ownership token.
    ///
    /// Suspends the calling task (not the worker thread) for at most
    /// `max_wait`. While blocked, a warning is logged at each configured
    /// checkpoint. Fails with [`DbError::LockTimeout`] once the budget is spent;
    /// the lock state is left untouched in that case.
    pub async fn acquire(&self) -> Result<LockToken> {
        event!(Level::DEBUG, "trying to acquire transaction lock");

        if let Some(token) = self.try_acquire()? {
            return Ok(token);
        }

        let started = Instant::now();
        // None when the budget does not fit in an Instant: wait without a deadline.
        let deadline = started.checked_add(self.config.max_wait);
        let mut checkpoints = self.config.effective_checkpoints().peekable();

        let acquire = self.semaphore.acquire();
        tokio::pin!(acquire);

        loop {
            let wake_at = match checkpoints.peek() {
                Some(checkpoint) => started.checked_add(*checkpoint),
                None => deadline,
            };

            let Some(wake_at) = wake_at else {
                let token = self.admit((&mut acquire).await?)?;
                event!(
                    Level::DEBUG,
                    token = %token,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "acquired transaction lock after unbounded wait"
                );
                return Ok(token);
            };

            tokio::select! {
                biased;

                permit = &mut acquire => {
                    let token = self.admit(permit?)?;
                    event!(
                        Level::DEBUG,
                        token = %token,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "acquired transaction lock after waiting"
                    );
                    return Ok(token);
                }
                _ = sleep_until(wake_at) => {
                    match checkpoints.next() {
                        Some(checkpoint) => {
                            event!(
                                Level::WARN,
                                waited_ms = checkpoint.as_millis() as u64,
                                holder = %self.holder_label(),
                                "could not acquire transaction lock yet, still waiting"
                            );
                        }
                        None => {
                            event!(
                                Level::ERROR,
                                waited_ms = self.config.max_wait.as_millis() as u64,
                                holder = %self.holder_label(),
                                "gave up waiting for transaction lock"
                            );
                            return Err(DbError::LockTimeout {
                                waited: self.config.max_wait,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self) -> Result<Option<LockToken>> {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                let token = self.admit(permit)?;
                event!(Level::DEBUG, token = %token, "acquired transaction lock");
                Ok(Some(token))
            }
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => {
                Err(DbError::LockError("transaction lock semaphore closed".into()))
            }
        }
    }

    /// Give the lock back.
    ///
    /// Fails with [`DbError::InvalidOwner`] when `token` is not the current
    /// holder; the lock stays held by whoever holds it.
    pub fn release(&self, token: LockToken) -> Result<()> {
        let mut holder = self.holder.lock()?;

        if *holder != Some(token) {
            let current = label(*holder);
            event!(
                Level::ERROR,
                current = %current,
                requested = %token,
                "transaction lock release attempted by non-owner"
            );
            return Err(DbError::InvalidOwner {
                current,
                requested: token.to_string(),
            });
        }

        *holder = None;
        self.semaphore.add_permits(1);
        event!(Level::DEBUG, token = %token, "released transaction lock");
        Ok(())
    }

    /// Token of the current holder, if any.
    pub fn holder(&self) -> Option<LockToken> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    pub(crate) fn is_held_by(&self, token: LockToken) -> bool {
        self.holder() == Some(token)
    }

    fn admit(&self, permit: SemaphorePermit<'_>) -> Result<LockToken> {
        // On a poisoned holder the permit is dropped, which frees the slot again.
        let mut holder = self.holder.lock()?;
        permit.forget();

        let token = LockToken::new();
        *holder = Some(token);
        Ok(token)
    }

    fn holder_label(&self) -> String {
        label(self.holder())
    }
}

impl Default for TransactionLock {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

fn label(token: Option<LockToken>) -> String {
    token
        .map(|token| token.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn short_lock(max_wait_ms: u64) -> TransactionLock {
        TransactionLock::new(
            CoordinatorConfig::new()
                .max_wait(Duration::from_millis(max_wait_ms))
                .log_checkpoints([Duration::from_millis(10), Duration::from_millis(40)]),
        )
    }

    #[tokio::test]
    async fn test_acquire_free_lock_is_fast() {
        let lock = TransactionLock::default();
        let started = std::time::Instant::now();

        let token = lock.acquire().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(lock.holder(), Some(token));
        assert!(lock.is_locked());
    }

    #[tokio::test]
    async fn test_successive_acquisitions_mint_fresh_tokens() {
        let lock = TransactionLock::default();

        let first = lock.acquire().await.unwrap();
        lock.release(first).unwrap();
        let second = lock.acquire().await.unwrap();

        assert_ne!(first, second);
        lock.release(second).unwrap();
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_release_with_unrelated_token_keeps_lock_held() {
        let lock = TransactionLock::default();
        let owner = lock.acquire().await.unwrap();

        let result = lock.release(LockToken::new());

        assert!(matches!(result, Err(DbError::InvalidOwner { .. })));
        assert_eq!(lock.holder(), Some(owner));
    }

    #[tokio::test]
    async fn test_double_release_is_rejected() {
        let lock = TransactionLock::default();
        let token = lock.acquire().await.unwrap();

        lock.release(token).unwrap();
        let second = lock.release(token);

        assert!(matches!(second, Err(DbError::InvalidOwner { .. })));
        assert!(!lock.is_locked());
        // The slot was returned once, so exactly one acquirer gets in.
        let next = lock.try_acquire().unwrap();
        assert!(next.is_some());
        assert!(lock.try_acquire().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_times_out_and_leaves_state_unchanged() {
        let lock = short_lock(80);
        let owner = lock.acquire().await.unwrap();
        let started = std::time::Instant::now();

        let result = lock.acquire().await;

        assert!(matches!(result, Err(DbError::LockTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(lock.holder(), Some(owner));
    }

    #[tokio::test]
    async fn test_waiter_is_admitted_after_release() {
        let lock = Arc::new(short_lock(2_000));
        let owner = lock.acquire().await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        lock.release(owner).unwrap();
        let next = waiter.await.unwrap().unwrap();

        assert_ne!(next, owner);
        assert_eq!(lock.holder(), Some(next));
    }

    #[tokio::test]
    async fn test_unrepresentable_budget_waits_without_deadline() {
        let lock = Arc::new(TransactionLock::new(
            CoordinatorConfig::new()
                .max_wait(Duration::MAX)
                .log_checkpoints([Duration::from_millis(10)]),
        ));
        assert!(lock.config().validate().is_ok());
        let owner = lock.acquire().await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire().await })
        };

        // Past the only checkpoint, so the waiter is parked on the unbounded path.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        lock.release(owner).unwrap();
        let next = waiter.await.unwrap().unwrap();

        assert_ne!(next, owner);
        assert_eq!(lock.holder(), Some(next));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_blocked_acquire_logs_each_checkpoint_then_error() {
        let captured = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let captured = captured.clone();
                move || captured.clone()
            })
            .with_ansi(false)
            .with_max_level(Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let lock = short_lock(80);
        let _owner = lock.acquire().await.unwrap();
        assert!(matches!(
            lock.acquire().await,
            Err(DbError::LockTimeout { .. })
        ));

        let lines = captured.lines();
        let warnings: Vec<_> = lines
            .iter()
            .filter(|line| line.contains("WARN") && line.contains("still waiting"))
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("waited_ms=10"));
        assert!(warnings[1].contains("waited_ms=40"));

        let errors: Vec<_> = lines
            .iter()
            .filter(|line| line.contains("ERROR") && line.contains("gave up waiting"))
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("waited_ms=80"));
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn test_try_acquire_on_held_lock() {
        let lock = TransactionLock::default();
        let _owner = lock.try_acquire().unwrap().unwrap();
        assert!(lock.try_acquire().unwrap().is_none());
    }
}
