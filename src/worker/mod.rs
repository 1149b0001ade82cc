//! Isolated worker execution contexts.
//!
//! A worker is a task reachable only through its [`Port`]. The host never
//! shares memory with it: requests, results and key-seed handoff all travel
//! as messages. Secret-bearing workers are terminated after use, never
//! recycled.

pub mod control;
pub mod crypto;
pub mod handshake;
pub mod pool;
pub mod queue;
pub mod signer;
pub mod vrf;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::task::AbortHandle;

use crate::channel::Port;
use crate::error::WorkerError;
use crate::protocol::worker::WorkerRequest;
use crate::worker::control::{ControlKind, ControlOutcome, await_control};
use crate::worker::queue::{ProgressSender, WorkerQueue};

pub use pool::{SignerWorkerPool, SigningSessionEntry};
pub use signer::InProcessSignerSpawner;
pub use vrf::{InProcessVrfSpawner, VrfWorkerHandle};

/// A freshly started worker context, before its readiness check.
pub struct SpawnedWorker {
    pub id: u64,
    pub port: Port,
    pub task: AbortHandle,
}

/// Starts worker execution contexts.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<SpawnedWorker, WorkerError>;
}

/// A ready worker and its dispatcher.
pub struct WorkerHandle {
    id: u64,
    queue: WorkerQueue,
    task: AbortHandle,
    terminated: AtomicBool,
}

impl WorkerHandle {
    /// Wait for `WORKER_READY`, then hand the port to a [`WorkerQueue`].
    ///
    /// A worker that is not ready within `health_timeout` is terminated.
    pub async fn start(spawned: SpawnedWorker, health_timeout: Duration) -> Result<Self, WorkerError> {
        let SpawnedWorker { id, port, task } = spawned;
        let outcome = await_control(&port, id, ControlKind::WorkerReady, None, health_timeout, |m| {
            tracing::debug!(worker_id = id, kind = ?m.kind(), "Message before WORKER_READY");
        })
        .await;

        match outcome {
            Ok(ControlOutcome::Accepted(_)) => {}
            Ok(ControlOutcome::Rejected { reason }) => {
                task.abort();
                return Err(WorkerError::SpawnFailed { reason });
            }
            Err(WorkerError::ControlTimeout { timeout, .. }) => {
                task.abort();
                return Err(WorkerError::HealthCheckFailed {
                    worker_id: id,
                    timeout,
                });
            }
            Err(e) => {
                task.abort();
                return Err(e);
            }
        }

        tracing::debug!(worker_id = id, "Worker ready");
        Ok(Self {
            id,
            queue: WorkerQueue::start(id, port),
            task,
            terminated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn request(
        &self,
        request: WorkerRequest,
        progress: Option<ProgressSender>,
    ) -> Result<Value, WorkerError> {
        self.queue.request(request, progress).await
    }

    pub fn queue(&self) -> &WorkerQueue {
        &self.queue
    }

    /// Kill the worker context. Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
        self.queue.shutdown();
        tracing::debug!(worker_id = self.id, "Worker terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
