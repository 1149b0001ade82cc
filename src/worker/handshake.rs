//! Attach a private seed port to a signer worker.

use std::time::Duration;

use serde_json::json;

use crate::channel::{Port, PortMessage};
use crate::error::{SessionError, WorkerError};
use crate::protocol::worker::ATTACH_WRAP_KEY_SEED_PORT;
use crate::worker::WorkerHandle;
use crate::worker::control::{ControlKind, ControlOutcome};

/// Transfer `seed_port` to the worker and wait for `ATTACH_WRAP_KEY_SEED_PORT_OK`.
///
/// The caller owns teardown on failure: the worker must be forfeited.
pub async fn attach_wrap_key_seed_port(
    worker: &WorkerHandle,
    session_id: &str,
    seed_port: Port,
    timeout: Duration,
) -> Result<(), SessionError> {
    let message = PortMessage::new(json!({
        "type": ATTACH_WRAP_KEY_SEED_PORT,
        "sessionId": session_id,
    }))
    .with_port(seed_port);

    let outcome = worker
        .queue()
        .control(message, ControlKind::AttachAck, session_id, timeout)
        .await;

    match outcome {
        Ok(ControlOutcome::Accepted(_)) => {
            tracing::debug!(session_id, worker_id = worker.id(), "Seed port attached");
            Ok(())
        }
        Ok(ControlOutcome::Rejected { reason }) => Err(SessionError::HandshakeFailed {
            session_id: session_id.to_string(),
            reason,
        }),
        Err(WorkerError::ControlTimeout { timeout, .. }) => Err(SessionError::HandshakeTimeout {
            session_id: session_id.to_string(),
            timeout,
        }),
        Err(e) => Err(SessionError::HandshakeFailed {
            session_id: session_id.to_string(),
            reason: e.to_string(),
        }),
    }
}
