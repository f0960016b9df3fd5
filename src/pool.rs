//! Fixed-capacity pool of pre-warmed, isolated execution environments.
//!
//! The pool is the single point of backpressure for the whole judge: a
//! counting semaphore with one permit per environment bounds how many
//! untrusted programs run at once, no matter how many submissions are
//! queued. Handles move between an available queue (Available), an issued
//! [`Lease`] (Leased) and a detached disposal/replacement task
//! (Corrupted/Disposing); a handle is never lent to two callers at once.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PoolError;

/// Opaque handle to one isolated execution environment.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub root: PathBuf,
}

/// Raw captured outcome of one fixed-entry-command invocation.
#[derive(Debug, Clone)]
pub struct RawExec {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Blocking isolation backend behind the pool. The pool moves every call
/// onto the blocking thread pool; implementations stay synchronous.
pub trait ExecBackend: Send + Sync + 'static {
    fn create(&self, id: &str) -> Result<Container, PoolError>;
    fn wipe(&self, container: &Container) -> Result<(), PoolError>;
    fn destroy(&self, container: &Container);
    fn place_file(
        &self,
        container: &Container,
        rel_path: &str,
        content: &[u8],
        mode: u32,
    ) -> Result<(), PoolError>;
    fn exec(&self, container: &Container, payload: &str, timeout_ms: u64)
        -> Result<RawExec, PoolError>;
}

/// An environment on loan. Holding the lease holds the semaphore permit;
/// the permit is released by drop on every path, so flaky cleanup can never
/// shrink effective capacity.
pub struct Lease {
    container: Container,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn container(&self) -> &Container {
        &self.container
    }
}

pub struct ContainerPool {
    backend: Arc<dyn ExecBackend>,
    semaphore: Arc<Semaphore>,
    available: Arc<Mutex<VecDeque<Container>>>,
    capacity: usize,
}

impl ContainerPool {
    /// Creates and pre-warms `capacity` environments.
    pub async fn new(backend: Arc<dyn ExecBackend>, capacity: usize) -> Result<Self, PoolError> {
        let mut containers = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            let backend_clone = backend.clone();
            let id = Uuid::new_v4().to_string();
            let container = tokio::task::spawn_blocking(move || backend_clone.create(&id))
                .await
                .map_err(|e| PoolError::Backend(e.to_string()))??;
            containers.push_back(container);
        }
        info!(capacity, "container pool initialized");
        Ok(Self {
            backend,
            semaphore: Arc::new(Semaphore::new(capacity)),
            available: Arc::new(Mutex::new(containers)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently on loan.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn available_containers(&self) -> usize {
        self.available.lock().await.len()
    }

    /// Waits for a permit, then dequeues an available environment. If the
    /// queue is momentarily empty (a release's cleanup still in flight), a
    /// fresh environment is created instead of blocking; the permit
    /// already held keeps the concurrency ceiling intact. Cancellation:
    /// dropping the returned future abandons the wait; a disposed pool
    /// fails with [`PoolError::Closed`].
    pub async fn acquire(&self) -> Result<Lease, PoolError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let existing = self.available.lock().await.pop_front();
        let container = match existing {
            Some(container) => container,
            None => {
                let backend = self.backend.clone();
                let id = Uuid::new_v4().to_string();
                tokio::task::spawn_blocking(move || backend.create(&id))
                    .await
                    .map_err(|e| PoolError::Backend(e.to_string()))??
            }
        };

        Ok(Lease {
            container,
            _permit: permit,
        })
    }

    /// Returns an environment. Scratch state is wiped; a failed wipe marks
    /// the environment corrupted and schedules disposal plus a replacement
    /// on a detached task, off this caller's critical path. The permit is
    /// released when the lease drops at the end of this call, regardless of
    /// cleanup outcome.
    pub async fn release(&self, lease: Lease) {
        let Lease { container, _permit } = lease;

        let backend = self.backend.clone();
        let to_wipe = container.clone();
        let wiped = tokio::task::spawn_blocking(move || backend.wipe(&to_wipe)).await;

        match wiped {
            Ok(Ok(())) => self.offer(container).await,
            Ok(Err(e)) => {
                warn!(container = %container.id, error = %e, "cleanup failed, replacing container");
                self.spawn_replacement(container);
            }
            Err(e) => {
                warn!(container = %container.id, error = %e, "cleanup task failed, replacing container");
                self.spawn_replacement(container);
            }
        }
    }

    /// Disposes the corrupted environment and creates its replacement on a
    /// detached task.
    fn spawn_replacement(&self, corrupted: Container) {
        let backend = self.backend.clone();
        let available = self.available.clone();
        let capacity = self.capacity;
        tokio::spawn(async move {
            let destroy_backend = backend.clone();
            let to_destroy = corrupted.clone();
            let _ = tokio::task::spawn_blocking(move || destroy_backend.destroy(&to_destroy)).await;

            let create_backend = backend.clone();
            let id = Uuid::new_v4().to_string();
            match tokio::task::spawn_blocking(move || create_backend.create(&id)).await {
                Ok(Ok(replacement)) => {
                    Self::offer_to(&available, &backend, capacity, replacement).await;
                    info!(corrupted = %corrupted.id, "replaced corrupted container");
                }
                Ok(Err(e)) => {
                    error!(corrupted = %corrupted.id, error = %e, "failed to create replacement container")
                }
                Err(e) => {
                    error!(corrupted = %corrupted.id, error = %e, "replacement task failed")
                }
            }
        });
    }

    async fn offer(&self, container: Container) {
        Self::offer_to(&self.available, &self.backend, self.capacity, container).await;
    }

    /// Re-enqueues a handle, destroying it instead when the queue is
    /// already full (an acquire-side fallback may have materialized the
    /// replacement first).
    async fn offer_to(
        available: &Mutex<VecDeque<Container>>,
        backend: &Arc<dyn ExecBackend>,
        capacity: usize,
        container: Container,
    ) {
        let mut queue = available.lock().await;
        if queue.len() < capacity {
            queue.push_back(container);
        } else {
            drop(queue);
            let backend = backend.clone();
            let _ = tokio::task::spawn_blocking(move || backend.destroy(&container)).await;
        }
    }

    /// Writes a file into a leased environment.
    pub async fn place_file(
        &self,
        lease: &Lease,
        rel_path: &str,
        content: Vec<u8>,
        mode: u32,
    ) -> Result<(), PoolError> {
        let backend = self.backend.clone();
        let container = lease.container().clone();
        let rel_path = rel_path.to_string();
        tokio::task::spawn_blocking(move || {
            backend.place_file(&container, &rel_path, &content, mode)
        })
        .await
        .map_err(|e| PoolError::Backend(e.to_string()))?
    }

    /// Invokes the single fixed entry command inside the leased environment
    /// with one opaque encoded payload, capturing stdout/stderr.
    pub async fn exec_in_container(
        &self,
        lease: &Lease,
        payload: String,
        timeout_ms: u64,
    ) -> Result<RawExec, PoolError> {
        let backend = self.backend.clone();
        let container = lease.container().clone();
        tokio::task::spawn_blocking(move || backend.exec(&container, &payload, timeout_ms))
            .await
            .map_err(|e| PoolError::Backend(e.to_string()))?
    }

    /// Drains the queue and force-removes every environment; best-effort.
    /// Blocked `acquire` calls fail with [`PoolError::Closed`].
    pub async fn dispose(&self) {
        self.semaphore.close();
        let drained: Vec<Container> = self.available.lock().await.drain(..).collect();
        for container in drained {
            let backend = self.backend.clone();
            let _ = tokio::task::spawn_blocking(move || backend.destroy(&container)).await;
        }
        info!("container pool disposed");
    }
}
