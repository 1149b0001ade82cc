//! Signer worker pool and signing-session manager.
//!
//! Workers are pre-spawned up to capacity and health-checked before they are
//! pooled. A session takes one worker exclusively; when the session ends,
//! for whatever reason, that worker is terminated and a fresh one is spawned
//! in the background to take its place. Only never-used workers sit idle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{MessageChannel, Port, PortCloser};
use crate::config::WorkerPoolConfig;
use crate::error::{Error, Result, SessionError, WorkerError};
use crate::protocol::worker::WorkerRequest;
use crate::worker::control::ControlOutcome;
use crate::worker::handshake::attach_wrap_key_seed_port;
use crate::worker::queue::ProgressSender;
use crate::worker::{WorkerHandle, WorkerSpawner};

/// A reserved signing session.
pub struct SigningSessionEntry {
    worker: Arc<WorkerHandle>,
    wrap_key_seed_port: PortCloser,
    created_at: Instant,
}

impl SigningSessionEntry {
    pub fn worker_id(&self) -> u64 {
        self.worker.id()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn destroy(self) {
        self.worker.terminate();
        self.wrap_key_seed_port.close();
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Arc<WorkerHandle>>,
    sessions: HashMap<String, SigningSessionEntry>,
    reserving: HashSet<String>,
    /// Workers that exist: idle, in a session, borrowed, or still spawning.
    live: usize,
}

struct PoolInner {
    config: WorkerPoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    state: Mutex<PoolState>,
    /// Serializes refills so a caller of `fill` sees background work finish.
    fill_lock: tokio::sync::Mutex<()>,
    replenishing: AtomicBool,
    shutdown: CancellationToken,
}

/// Bounded pool of signer workers plus the session table.
#[derive(Clone)]
pub struct SignerWorkerPool {
    inner: Arc<PoolInner>,
}

impl SignerWorkerPool {
    pub fn new(config: WorkerPoolConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                spawner,
                state: Mutex::new(PoolState::default()),
                fill_lock: tokio::sync::Mutex::new(()),
                replenishing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn idle_worker_ids(&self) -> Vec<u64> {
        self.inner.state.lock().idle.iter().map(|w| w.id()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn live_count(&self) -> usize {
        self.inner.state.lock().live
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.inner.state.lock().sessions.contains_key(session_id)
    }

    pub fn session_worker_id(&self, session_id: &str) -> Option<u64> {
        self.inner
            .state
            .lock()
            .sessions
            .get(session_id)
            .map(SigningSessionEntry::worker_id)
    }

    /// Refill the idle pool in the background. Never blocks.
    pub fn prewarm(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.inner.replenishing.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        runtime.spawn(async move {
            let result = pool.fill().await;
            pool.inner.replenishing.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                tracing::warn!("Signer worker replenishment failed: {}", e);
            }
        });
    }

    /// Spawn and health-check workers until the pool is at capacity.
    pub async fn fill(&self) -> std::result::Result<(), WorkerError> {
        let _guard = self.inner.fill_lock.lock().await;
        loop {
            {
                let mut state = self.inner.state.lock();
                if self.inner.shutdown.is_cancelled() || state.live >= self.inner.config.capacity {
                    return Ok(());
                }
                state.live += 1;
            }

            match self.spawn_ready().await {
                Ok(worker) => {
                    let mut state = self.inner.state.lock();
                    if self.inner.shutdown.is_cancelled() {
                        worker.terminate();
                        state.live = state.live.saturating_sub(1);
                        return Ok(());
                    }
                    tracing::debug!(worker_id = worker.id(), "Signer worker pooled");
                    state.idle.push_back(Arc::new(worker));
                }
                Err(e) => {
                    let mut state = self.inner.state.lock();
                    state.live = state.live.saturating_sub(1);
                    return Err(e);
                }
            }
        }
    }

    async fn spawn_ready(&self) -> std::result::Result<WorkerHandle, WorkerError> {
        let spawned = self.inner.spawner.spawn()?;
        WorkerHandle::start(spawned, self.inner.config.health_check_timeout).await
    }

    /// Take an idle worker, or spawn one if under capacity.
    async fn acquire(&self) -> std::result::Result<Arc<WorkerHandle>, WorkerError> {
        let idle = {
            let mut state = self.inner.state.lock();
            match state.idle.pop_front() {
                Some(worker) => Some(worker),
                None if state.live < self.inner.config.capacity => {
                    state.live += 1;
                    None
                }
                None => {
                    return Err(WorkerError::PoolExhausted {
                        capacity: self.inner.config.capacity,
                    });
                }
            }
        };

        match idle {
            Some(worker) => Ok(worker),
            None => match self.spawn_ready().await {
                Ok(worker) => Ok(Arc::new(worker)),
                Err(e) => {
                    let mut state = self.inner.state.lock();
                    state.live = state.live.saturating_sub(1);
                    Err(e)
                }
            },
        }
    }

    /// Terminate a worker that will never be reused and start a replacement.
    fn forfeit(&self, worker: &WorkerHandle) {
        worker.terminate();
        {
            let mut state = self.inner.state.lock();
            state.live = state.live.saturating_sub(1);
        }
        self.prewarm();
    }

    /// Reserve a worker for `session_id` and attach a fresh seed channel.
    ///
    /// Returns the VRF-side endpoint of the channel; the other end now lives
    /// in the signer worker.
    pub async fn reserve_session(&self, session_id: &str) -> Result<Port> {
        let (vrf_side, signer_side) = MessageChannel::new().into_ports();
        match self.reserve_session_with_port(session_id, signer_side).await {
            Ok(()) => Ok(vrf_side),
            Err(e) => {
                vrf_side.close();
                Err(e)
            }
        }
    }

    /// Reserve a worker for `session_id`, transferring `seed_port` to it.
    ///
    /// The session becomes visible only after the worker acknowledges the
    /// port. On any failure the port is closed and the worker forfeited.
    pub async fn reserve_session_with_port(&self, session_id: &str, seed_port: Port) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.sessions.contains_key(session_id) || state.reserving.contains(session_id) {
                drop(state);
                seed_port.close();
                return Err(SessionError::AlreadyExists {
                    session_id: session_id.to_string(),
                }
                .into());
            }
            state.reserving.insert(session_id.to_string());
        }

        let worker = match self.acquire().await {
            Ok(worker) => worker,
            Err(e) => {
                self.inner.state.lock().reserving.remove(session_id);
                seed_port.close();
                return Err(e.into());
            }
        };

        let closer = seed_port.closer();
        let attached = attach_wrap_key_seed_port(
            &worker,
            session_id,
            seed_port,
            self.inner.config.handshake_timeout,
        )
        .await;

        if let Err(e) = attached {
            tracing::warn!(
                session_id,
                worker_id = worker.id(),
                "Signing session handshake failed: {}",
                e
            );
            closer.close();
            self.inner.state.lock().reserving.remove(session_id);
            self.forfeit(&worker);
            return Err(e.into());
        }

        {
            let mut state = self.inner.state.lock();
            state.reserving.remove(session_id);
            state.sessions.insert(
                session_id.to_string(),
                SigningSessionEntry {
                    worker: Arc::clone(&worker),
                    wrap_key_seed_port: closer,
                    created_at: Instant::now(),
                },
            );
        }
        tracing::info!(session_id, worker_id = worker.id(), "Signing session reserved");
        Ok(())
    }

    /// Send a session-bound operation to the session's worker.
    pub async fn send_message(
        &self,
        session_id: &str,
        request: WorkerRequest,
        progress: Option<ProgressSender>,
    ) -> Result<Value> {
        if request.session_id() != Some(session_id) {
            return Err(Error::InvalidRequest(format!(
                "{} is not bound to session {session_id}",
                request.name()
            )));
        }
        let worker = self
            .inner
            .state
            .lock()
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry.worker))
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;

        self.await_seed(session_id, &worker).await?;

        let timeout = self.inner.config.operation_timeout;
        match tokio::time::timeout(timeout, worker.request(request, progress)).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e @ (WorkerError::Crashed { .. } | WorkerError::MalformedResponse { .. }))) => {
                tracing::warn!(session_id, "Signer worker failed fatally: {}", e);
                self.release_session(session_id);
                Err(e.into())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(session_id, ?timeout, "Signer worker operation timed out");
                self.release_session(session_id);
                Err(SessionError::OperationTimeout {
                    session_id: session_id.to_string(),
                    timeout,
                }
                .into())
            }
        }
    }

    /// Wait, bounded by the handshake timeout, for the session's seed handoff.
    ///
    /// A session whose seed never arrives, or arrives broken, is released.
    async fn await_seed(&self, session_id: &str, worker: &WorkerHandle) -> Result<()> {
        let timeout = self.inner.config.handshake_timeout;
        let reason = match worker.queue().wait_seed_ready(session_id, timeout).await {
            Ok(ControlOutcome::Accepted(_)) => return Ok(()),
            Ok(ControlOutcome::Rejected { reason }) => reason,
            Err(WorkerError::ControlTimeout { timeout, .. }) => {
                format!("not delivered within {timeout:?}")
            }
            Err(e) => {
                tracing::warn!(session_id, "Signer worker lost before seed handoff: {}", e);
                self.release_session(session_id);
                return Err(e.into());
            }
        };
        tracing::warn!(session_id, reason = %reason, "Wrap key seed unavailable");
        self.release_session(session_id);
        Err(SessionError::SeedUnavailable {
            session_id: session_id.to_string(),
            reason,
        }
        .into())
    }

    /// Run one operation that needs no session. The worker is terminated afterwards.
    pub async fn execute_stateless(
        &self,
        request: WorkerRequest,
        progress: Option<ProgressSender>,
    ) -> Result<Value> {
        if let Some(session_id) = request.session_id() {
            return Err(Error::InvalidRequest(format!(
                "{} is bound to session {session_id}",
                request.name()
            )));
        }
        let worker = self.acquire().await?;
        let timeout = self.inner.config.operation_timeout;
        let outcome = tokio::time::timeout(timeout, worker.request(request, progress)).await;
        self.forfeit(&worker);

        match outcome {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(WorkerError::OperationFailed {
                operation: "stateless".to_string(),
                reason: format!("timed out after {timeout:?}"),
            }
            .into()),
        }
    }

    /// End a session: terminate its worker and close its port.
    pub fn release_session(&self, session_id: &str) -> bool {
        let entry = {
            let mut state = self.inner.state.lock();
            let entry = state.sessions.remove(session_id);
            if entry.is_some() {
                state.live = state.live.saturating_sub(1);
            }
            entry
        };
        match entry {
            Some(entry) => {
                tracing::info!(session_id, worker_id = entry.worker_id(), "Signing session released");
                entry.destroy();
                self.prewarm();
                true
            }
            None => false,
        }
    }

    /// Release every session older than the configured TTL.
    pub fn sweep_expired_sessions(&self) -> usize {
        let ttl = self.inner.config.session_ttl;
        let expired: Vec<SigningSessionEntry> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<String> = state
                .sessions
                .iter()
                .filter(|(_, entry)| entry.created_at.elapsed() > ttl)
                .map(|(id, _)| id.clone())
                .collect();
            let expired: Vec<_> = ids
                .iter()
                .filter_map(|id| state.sessions.remove(id))
                .collect();
            state.live = state.live.saturating_sub(expired.len());
            expired
        };

        let count = expired.len();
        for entry in expired {
            tracing::info!(worker_id = entry.worker_id(), "Expired signing session swept");
            entry.destroy();
        }
        if count > 0 {
            self.prewarm();
        }
        count
    }

    /// Sweep on the configured interval until [`shutdown`](Self::shutdown).
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let interval = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        pool.sweep_expired_sessions();
                    }
                }
            }
        })
    }

    /// Terminate every worker and stop replenishing.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let (idle, sessions) = {
            let mut state = self.inner.state.lock();
            state.live = 0;
            (
                state.idle.drain(..).collect::<Vec<_>>(),
                state.sessions.drain().map(|(_, e)| e).collect::<Vec<_>>(),
            )
        };
        for worker in idle {
            worker.terminate();
        }
        for entry in sessions {
            entry.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::worker::signer::InProcessSignerSpawner;

    fn config(capacity: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            capacity,
            ..WorkerPoolConfig::default()
        }
    }

    fn pool(capacity: usize) -> SignerWorkerPool {
        SignerWorkerPool::new(config(capacity), Arc::new(InProcessSignerSpawner))
    }

    #[tokio::test]
    async fn fill_spawns_to_capacity() {
        let pool = pool(3);
        pool.fill().await.unwrap();
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.live_count(), 3);
    }

    #[tokio::test]
    async fn duplicate_reservation_leaves_pool_untouched() {
        let pool = pool(2);
        pool.fill().await.unwrap();
        let _vrf = pool.reserve_session("s1").await.unwrap();
        let idle_before = pool.idle_worker_ids();
        let worker_before = pool.session_worker_id("s1");

        let err = pool.reserve_session("s1").await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::AlreadyExists { .. })));
        assert_eq!(pool.idle_worker_ids(), idle_before);
        assert_eq!(pool.session_worker_id("s1"), worker_before);
    }

    #[tokio::test]
    async fn released_worker_is_never_reused() {
        let pool = pool(1);
        pool.fill().await.unwrap();
        let _vrf = pool.reserve_session("s1").await.unwrap();
        let used = pool.session_worker_id("s1").unwrap();

        assert!(pool.release_session("s1"));
        assert!(!pool.release_session("s1"));
        pool.fill().await.unwrap();

        assert_eq!(pool.idle_count(), 1);
        assert!(!pool.idle_worker_ids().contains(&used));
    }

    #[tokio::test]
    async fn capacity_bounds_sessions() {
        let pool = pool(1);
        let _vrf = pool.reserve_session("s1").await.unwrap();
        let err = pool.reserve_session("s2").await.unwrap_err();
        assert!(matches!(err, Error::Worker(WorkerError::PoolExhausted { capacity: 1 })));
        assert!(!pool.has_session("s2"));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let pool = pool(1);
        let request = WorkerRequest::DeriveKeypairAndEncrypt(
            crate::protocol::worker::DeriveKeypairRequest {
                session_id: "nope".to_string(),
                account_id: "alice.testnet".to_string(),
            },
        );
        let err = pool.send_message("nope", request, None).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_releases_only_expired_sessions() {
        let pool = SignerWorkerPool::new(
            WorkerPoolConfig {
                capacity: 2,
                session_ttl: Duration::from_secs(300),
                ..WorkerPoolConfig::default()
            },
            Arc::new(InProcessSignerSpawner),
        );
        let _old = pool.reserve_session("old").await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        let _new = pool.reserve_session("new").await.unwrap();
        tokio::time::advance(Duration::from_secs(101)).await;

        assert_eq!(pool.sweep_expired_sessions(), 1);
        assert!(!pool.has_session("old"));
        assert!(pool.has_session("new"));
    }

    #[tokio::test]
    async fn shutdown_terminates_everything() {
        let pool = pool(2);
        pool.fill().await.unwrap();
        let _vrf = pool.reserve_session("s1").await.unwrap();
        pool.shutdown();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.session_count(), 0);
        pool.prewarm();
        assert_eq!(pool.live_count(), 0);
    }
}
