//! Per-worker FIFO dispatcher.
//!
//! One task owns the worker's port and is its only reader. Jobs run strictly
//! one at a time; each completion goes to the oneshot of the job that caused
//! it. Lifecycle messages that arrive between jobs are still drained so a
//! seed-ready signal is never lost.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::channel::{Port, PortMessage};
use crate::error::WorkerError;
use crate::protocol::worker::{
    RESPONSE_FAILURE, RESPONSE_PROGRESS, RESPONSE_RESULT, WRAP_KEY_SEED_READY, WorkerRequest,
    WorkerResponse,
};
use crate::worker::control::{ControlKind, ControlOutcome, await_control};

/// Progress sink for one operation.
pub type ProgressSender = mpsc::UnboundedSender<Value>;

/// Last seed handoff outcome the worker reported.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SeedSignal {
    session_id: String,
    error: Option<String>,
}

enum Job {
    Operation {
        operation: &'static str,
        message: PortMessage,
        progress: Option<ProgressSender>,
        reply: oneshot::Sender<Result<Value, WorkerError>>,
    },
    Notify {
        message: PortMessage,
    },
    Control {
        message: PortMessage,
        kind: ControlKind,
        session_id: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<ControlOutcome, WorkerError>>,
    },
}

/// Serialize a typed request into the message posted to a worker.
pub fn encode_request<T: Serialize>(operation: &str, request: &T) -> Result<PortMessage, WorkerError> {
    serde_json::to_value(request)
        .map(PortMessage::new)
        .map_err(|e| WorkerError::OperationFailed {
            operation: operation.to_string(),
            reason: format!("request serialization failed: {e}"),
        })
}

pub struct WorkerQueue {
    worker_id: u64,
    jobs: mpsc::UnboundedSender<Job>,
    seed_ready: watch::Receiver<Option<SeedSignal>>,
    dispatcher: AbortHandle,
}

impl WorkerQueue {
    /// Take ownership of `port` and start dispatching.
    pub fn start(worker_id: u64, port: Port) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let (seed_tx, seed_ready) = watch::channel(None);
        let dispatcher = tokio::spawn(dispatch(worker_id, port, rx, seed_tx)).abort_handle();
        Self {
            worker_id,
            jobs,
            seed_ready,
            dispatcher,
        }
    }

    fn crashed(&self) -> WorkerError {
        WorkerError::Crashed {
            worker_id: self.worker_id,
        }
    }

    /// Run one signer operation and wait for its completion.
    pub async fn request(
        &self,
        request: WorkerRequest,
        progress: Option<ProgressSender>,
    ) -> Result<Value, WorkerError> {
        let operation = request.name();
        let message = encode_request(operation, &request)?;
        self.submit(operation, message, progress).await
    }

    /// Post `message` and wait for the worker's `RESULT` or `FAILURE`.
    pub async fn submit(
        &self,
        operation: &'static str,
        message: PortMessage,
        progress: Option<ProgressSender>,
    ) -> Result<Value, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Operation {
                operation,
                message,
                progress,
                reply,
            })
            .map_err(|_| self.crashed())?;
        rx.await.map_err(|_| self.crashed())?
    }

    /// Queue a message the worker does not answer.
    pub fn notify(&self, message: PortMessage) -> Result<(), WorkerError> {
        self.jobs
            .send(Job::Notify { message })
            .map_err(|_| self.crashed())
    }

    /// Post a lifecycle command and wait for its acknowledgement.
    pub async fn control(
        &self,
        message: PortMessage,
        kind: ControlKind,
        session_id: &str,
        timeout: Duration,
    ) -> Result<ControlOutcome, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Control {
                message,
                kind,
                session_id: session_id.to_string(),
                timeout,
                reply,
            })
            .map_err(|_| self.crashed())?;
        rx.await.map_err(|_| self.crashed())?
    }

    /// Wait until the worker reports the seed handoff for `session_id`.
    ///
    /// `Rejected` carries the reason when the handoff failed inside the
    /// worker.
    pub async fn wait_seed_ready(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<ControlOutcome, WorkerError> {
        let mut rx = self.seed_ready.clone();
        let wait = rx.wait_for(|signal| {
            signal
                .as_ref()
                .is_some_and(|signal| signal.session_id == session_id)
        });
        let signal = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(signal)) => signal.clone(),
            Ok(Err(_)) => return Err(self.crashed()),
            Err(_) => {
                return Err(WorkerError::ControlTimeout {
                    worker_id: self.worker_id,
                    message: ControlKind::SeedReady.label(),
                    timeout,
                });
            }
        };
        Ok(match signal.and_then(|signal| signal.error) {
            Some(reason) => ControlOutcome::Rejected { reason },
            None => ControlOutcome::Accepted(Value::Null),
        })
    }

    /// Stop dispatching. Dropping the port ends the worker's inbound stream.
    pub fn shutdown(&self) {
        self.dispatcher.abort();
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn note_out_of_band(worker_id: u64, message: PortMessage, seed_tx: &watch::Sender<Option<SeedSignal>>) {
    match message.kind() {
        Some(WRAP_KEY_SEED_READY) => {
            let Some(session_id) = message.data.get("sessionId").and_then(Value::as_str) else {
                tracing::debug!(worker_id, "Seed signal without sessionId");
                return;
            };
            let error = message
                .data
                .get("error")
                .and_then(Value::as_str)
                .map(String::from);
            tracing::debug!(worker_id, session_id, failed = error.is_some(), "Wrap key seed signal");
            seed_tx.send_replace(Some(SeedSignal {
                session_id: session_id.to_string(),
                error,
            }));
        }
        other => {
            tracing::debug!(worker_id, kind = ?other, "Ignoring unsolicited worker message");
        }
    }
}

async fn dispatch(
    worker_id: u64,
    port: Port,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    seed_tx: watch::Sender<Option<SeedSignal>>,
) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            message = port.recv() => match message {
                Some(message) => {
                    note_out_of_band(worker_id, message, &seed_tx);
                    continue;
                }
                None => {
                    tracing::debug!(worker_id, "Worker port closed");
                    break;
                }
            },
        };

        match job {
            Job::Operation {
                operation,
                message,
                progress,
                reply,
            } => {
                let outcome =
                    run_operation(worker_id, &port, operation, message, progress, &seed_tx).await;
                let _ = reply.send(outcome);
            }
            Job::Notify { message } => {
                if port.post(message).is_err() {
                    tracing::debug!(worker_id, "Notification to closed worker dropped");
                    break;
                }
            }
            Job::Control {
                message,
                kind,
                session_id,
                timeout,
                reply,
            } => {
                let outcome = match port.post(message) {
                    Ok(()) => {
                        await_control(&port, worker_id, kind, Some(&session_id), timeout, |m| {
                            note_out_of_band(worker_id, m, &seed_tx)
                        })
                        .await
                    }
                    Err(_) => Err(WorkerError::Crashed { worker_id }),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    // Fail whatever is still queued.
    jobs.close();
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Operation { reply, .. } => {
                let _ = reply.send(Err(WorkerError::Crashed { worker_id }));
            }
            Job::Control { reply, .. } => {
                let _ = reply.send(Err(WorkerError::Crashed { worker_id }));
            }
            Job::Notify { .. } => {}
        }
    }
}

async fn run_operation(
    worker_id: u64,
    port: &Port,
    operation: &'static str,
    message: PortMessage,
    progress: Option<ProgressSender>,
    seed_tx: &watch::Sender<Option<SeedSignal>>,
) -> Result<Value, WorkerError> {
    port.post(message)
        .map_err(|_| WorkerError::Crashed { worker_id })?;

    loop {
        let Some(message) = port.recv().await else {
            return Err(WorkerError::Crashed { worker_id });
        };
        let is_response = matches!(
            message.kind(),
            Some(RESPONSE_PROGRESS | RESPONSE_RESULT | RESPONSE_FAILURE)
        );
        if !is_response {
            note_out_of_band(worker_id, message, seed_tx);
            continue;
        }

        let response: WorkerResponse =
            serde_json::from_value(message.data).map_err(|e| WorkerError::MalformedResponse {
                worker_id,
                reason: e.to_string(),
            })?;
        match response {
            WorkerResponse::Progress { payload } => {
                if let Some(progress) = &progress {
                    let _ = progress.send(payload);
                }
            }
            WorkerResponse::Result { payload } => return Ok(payload),
            WorkerResponse::Failure { error } => {
                return Err(WorkerError::OperationFailed {
                    operation: operation.to_string(),
                    reason: error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::protocol::worker::SignWithKeyPairRequest;
    use serde_json::json;

    fn stateless_request(nonce: u64) -> WorkerRequest {
        WorkerRequest::SignTransactionWithKeyPair(SignWithKeyPairRequest {
            private_key: "ed25519:x".to_string(),
            signer_id: "alice.testnet".to_string(),
            transactions: Vec::new(),
            nonce,
            block_hash: "h".to_string(),
        })
    }

    /// Echo worker: replies with the request nonce, after one progress event.
    fn spawn_echo(worker: Port) {
        tokio::spawn(async move {
            while let Some(message) = worker.recv().await {
                let nonce = message.data["payload"]["nonce"].clone();
                worker
                    .post_json(json!({ "type": "PROGRESS", "payload": { "step": 1 } }))
                    .unwrap();
                worker
                    .post_json(json!({ "type": "RESULT", "payload": { "nonce": nonce } }))
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn completions_reach_their_own_callers() {
        let (host, worker) = MessageChannel::new().into_ports();
        spawn_echo(worker);
        let queue = std::sync::Arc::new(WorkerQueue::start(1, host));

        let mut handles = Vec::new();
        for nonce in 0..8u64 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let result = queue.request(stateless_request(nonce), None).await.unwrap();
                assert_eq!(result["nonce"], nonce);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn progress_is_forwarded_before_result() {
        let (host, worker) = MessageChannel::new().into_ports();
        spawn_echo(worker);
        let queue = WorkerQueue::start(2, host);
        let (tx, mut rx) = mpsc::unbounded_channel();

        queue.request(stateless_request(5), Some(tx)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap()["step"], 1);
    }

    #[tokio::test]
    async fn malformed_response_is_reported() {
        let (host, worker) = MessageChannel::new().into_ports();
        tokio::spawn(async move {
            while worker.recv().await.is_some() {
                worker.post_json(json!({ "type": "RESULT" })).unwrap();
            }
        });
        let queue = WorkerQueue::start(3, host);
        let err = queue.request(stateless_request(1), None).await.unwrap_err();
        assert!(matches!(err, WorkerError::MalformedResponse { worker_id: 3, .. }));
    }

    #[tokio::test]
    async fn worker_exit_fails_pending_request() {
        let (host, worker) = MessageChannel::new().into_ports();
        tokio::spawn(async move {
            let _ = worker.recv().await;
            drop(worker);
        });
        let queue = WorkerQueue::start(4, host);
        let err = queue.request(stateless_request(1), None).await.unwrap_err();
        assert!(matches!(err, WorkerError::Crashed { worker_id: 4 }));
    }

    #[tokio::test]
    async fn seed_ready_between_jobs_is_not_lost() {
        let (host, worker) = MessageChannel::new().into_ports();
        worker
            .post_json(json!({ "type": WRAP_KEY_SEED_READY, "sessionId": "s1", "ok": true }))
            .unwrap();
        let queue = WorkerQueue::start(5, host);
        let outcome = queue
            .wait_seed_ready("s1", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(outcome, ControlOutcome::Accepted(_)));
        drop(worker);
    }

    #[tokio::test]
    async fn failed_seed_handoff_is_reported() {
        let (host, worker) = MessageChannel::new().into_ports();
        worker
            .post_json(json!({
                "type": WRAP_KEY_SEED_READY,
                "sessionId": "s1",
                "ok": false,
                "error": "ceremony cancelled",
            }))
            .unwrap();
        let queue = WorkerQueue::start(6, host);
        let outcome = queue
            .wait_seed_ready("s1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ControlOutcome::Rejected {
                reason: "ceremony cancelled".to_string()
            }
        );
        drop(worker);
    }

    #[tokio::test(start_paused = true)]
    async fn seed_for_another_session_does_not_count() {
        let (host, worker) = MessageChannel::new().into_ports();
        worker
            .post_json(json!({ "type": WRAP_KEY_SEED_READY, "sessionId": "other", "ok": true }))
            .unwrap();
        let queue = WorkerQueue::start(7, host);
        let err = queue
            .wait_seed_ready("s1", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ControlTimeout { worker_id: 7, .. }));
        drop(worker);
    }

    #[tokio::test]
    async fn notifications_are_not_awaited() {
        let (host, worker) = MessageChannel::new().into_ports();
        spawn_echo_after_notice(worker);
        let queue = WorkerQueue::start(8, host);
        queue
            .notify(PortMessage::new(json!({ "type": "NOTICE" })))
            .unwrap();
        let result = queue.request(stateless_request(3), None).await.unwrap();
        assert_eq!(result["notices"], 1);
        assert_eq!(result["nonce"], 3);
    }

    /// Counts `NOTICE` messages and reports the count with each result.
    fn spawn_echo_after_notice(worker: Port) {
        tokio::spawn(async move {
            let mut notices = 0;
            while let Some(message) = worker.recv().await {
                if message.kind() == Some("NOTICE") {
                    notices += 1;
                    continue;
                }
                let nonce = message.data["payload"]["nonce"].clone();
                worker
                    .post_json(json!({
                        "type": "RESULT",
                        "payload": { "nonce": nonce, "notices": notices },
                    }))
                    .unwrap();
            }
        });
    }
}
