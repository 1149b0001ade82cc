//! Lifecycle acknowledgements from worker contexts.
//!
//! Every wait is bounded and, where the message carries one, correlated on
//! `sessionId`. Messages that do not match are handed back to the caller.

use std::time::Duration;

use serde_json::Value;

use crate::channel::{Port, PortMessage};
use crate::error::WorkerError;
use crate::protocol::worker::{
    ATTACH_WRAP_KEY_SEED_PORT_ERROR, ATTACH_WRAP_KEY_SEED_PORT_OK, WORKER_READY,
    WRAP_KEY_SEED_READY,
};

/// Which acknowledgement is awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    WorkerReady,
    AttachAck,
    SeedReady,
}

impl ControlKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::WorkerReady => WORKER_READY,
            Self::AttachAck => ATTACH_WRAP_KEY_SEED_PORT_OK,
            Self::SeedReady => WRAP_KEY_SEED_READY,
        }
    }

    fn matches(self, kind: &str) -> bool {
        match self {
            Self::WorkerReady => kind == WORKER_READY,
            Self::AttachAck => {
                kind == ATTACH_WRAP_KEY_SEED_PORT_OK || kind == ATTACH_WRAP_KEY_SEED_PORT_ERROR
            }
            Self::SeedReady => kind == WRAP_KEY_SEED_READY,
        }
    }
}

/// A matched acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    Accepted(Value),
    Rejected { reason: String },
}

fn session_matches(data: &Value, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => data.get("sessionId").and_then(Value::as_str) == Some(expected),
    }
}

fn classify(kind: ControlKind, message: &PortMessage) -> ControlOutcome {
    let data = &message.data;
    let rejected = match kind {
        ControlKind::AttachAck => message.kind() == Some(ATTACH_WRAP_KEY_SEED_PORT_ERROR),
        ControlKind::WorkerReady => data.get("ready").and_then(Value::as_bool) == Some(false),
        ControlKind::SeedReady => false,
    };
    if rejected {
        let reason = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("worker rejected the request")
            .to_string();
        ControlOutcome::Rejected { reason }
    } else {
        ControlOutcome::Accepted(data.clone())
    }
}

/// Read `port` until the awaited acknowledgement arrives.
///
/// Fails with [`WorkerError::ControlTimeout`] when `timeout` elapses and with
/// [`WorkerError::Crashed`] when the port closes first.
pub async fn await_control(
    port: &Port,
    worker_id: u64,
    kind: ControlKind,
    session_id: Option<&str>,
    timeout: Duration,
    mut unmatched: impl FnMut(PortMessage),
) -> Result<ControlOutcome, WorkerError> {
    let wait = async {
        loop {
            let Some(message) = port.recv().await else {
                return Err(WorkerError::Crashed { worker_id });
            };
            let is_match = message.kind().is_some_and(|k| kind.matches(k))
                && session_matches(&message.data, session_id);
            if is_match {
                return Ok(classify(kind, &message));
            }
            unmatched(message);
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                worker_id,
                session_id = session_id.unwrap_or("-"),
                "Timed out waiting for {}",
                kind.label()
            );
            Err(WorkerError::ControlTimeout {
                worker_id,
                message: kind.label(),
                timeout,
            })
        }
    }
}
