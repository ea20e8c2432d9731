use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Serializes store-mutating scheduler operations.
///
/// `acquire` returns `false` when the lock could not be obtained in time;
/// callers must `release` on every path after a successful acquire, which
/// [`ExecutionLockGuard`] does on drop.
#[async_trait]
pub trait ExecutionLock: Send + Sync + fmt::Debug {
    async fn acquire(&self, name: &str) -> anyhow::Result<bool>;

    fn release(&self, name: &str);
}

/// Which lock a store needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockKind {
    /// Embedded single-writer stores.
    Process,
    /// Databases that serialise conflicting writes themselves.
    Noop,
}

impl LockKind {
    pub fn build(self) -> Arc<dyn ExecutionLock> {
        match self {
            LockKind::Process => Arc::new(ProcessLock::default()),
            LockKind::Noop => Arc::new(NoopLock),
        }
    }
}

/// Holds a named lock until dropped.
pub struct ExecutionLockGuard {
    lock: Arc<dyn ExecutionLock>,
    name: String,
}

impl ExecutionLockGuard {
    /// Acquires `name`, returning `None` if the lock reported failure.
    pub async fn acquire(
        lock: &Arc<dyn ExecutionLock>,
        name: &str,
    ) -> anyhow::Result<Option<Self>> {
        if lock.acquire(name).await? {
            Ok(Some(Self {
                lock: Arc::clone(lock),
                name: name.to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ExecutionLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLockGuard")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for ExecutionLockGuard {
    fn drop(&mut self) {
        self.lock.release(&self.name);
    }
}

/// Process-local named mutex.
///
/// Sufficient for embedded stores: only one process can hold the database
/// file for writing, so cross-process coordination is unnecessary.
pub struct ProcessLock {
    acquire_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for ProcessLock {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ProcessLock {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            acquire_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, name: &str) -> Arc<Semaphore> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.locks
            .lock()
            .get(name)
            .is_some_and(|semaphore| semaphore.available_permits() == 0)
    }
}

impl fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held: Vec<String> = match self.locks.try_lock() {
            Some(locks) => locks
                .iter()
                .filter(|(_, semaphore)| semaphore.available_permits() == 0)
                .map(|(name, _)| name.clone())
                .collect(),
            None => vec!["<locked>".to_string()],
        };
        f.debug_struct("ProcessLock")
            .field("acquire_timeout", &self.acquire_timeout)
            .field("held", &held)
            .finish()
    }
}

#[async_trait]
impl ExecutionLock for ProcessLock {
    async fn acquire(&self, name: &str) -> anyhow::Result<bool> {
        let semaphore = self.semaphore(name);
        match tokio::time::timeout(self.acquire_timeout, semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                // Returned by `release`.
                permit.forget();
                Ok(true)
            }
            Ok(Err(_closed)) => anyhow::bail!("execution lock `{name}` was closed"),
            Err(_elapsed) => {
                tracing::warn!(lock = name, "timed out waiting for execution lock");
                Ok(false)
            }
        }
    }

    fn release(&self, name: &str) {
        let locks = self.locks.lock();
        match locks.get(name) {
            Some(semaphore) if semaphore.available_permits() == 0 => semaphore.add_permits(1),
            _ => tracing::warn!(lock = name, "release of an execution lock that is not held"),
        }
    }
}

/// Lock for databases that handle concurrent writers themselves. Claims
/// rely on conditional updates instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLock;

#[async_trait]
impl ExecutionLock for NoopLock {
    async fn acquire(&self, _name: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn release(&self, _name: &str) {}
}
