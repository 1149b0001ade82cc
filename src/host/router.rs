//! RPC router for the wallet host.
//!
//! Accepts the channel handshake, decodes envelopes and dispatches them.
//! Every request id gets at most one terminal envelope: the first terminal
//! wins and any later one is dropped, as is progress for an id that is
//! already finished. A cancelled handler stays in flight until it exits but
//! never posts again; `PM_CANCEL` owns its terminal.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::client::{Progress, WalletClient};
use crate::error::{ChannelError, Error, ErrorPayload};
use crate::host::WindowMessage;
use crate::host::context::HostContext;
use crate::host::handlers::{self, HandlerScope};
use crate::protocol::envelope::{ResultPayload, TYPE_CONNECT};
use crate::protocol::{AppMessage, HostRequest, InboundEnvelope, PROTOCOL_VERSION, decode_envelope};

/// How many finished request ids are remembered for duplicate suppression.
const FINISHED_CAPACITY: usize = 1024;

#[derive(Default)]
struct TerminalLedger {
    finished: HashSet<String>,
    order: VecDeque<String>,
}

impl TerminalLedger {
    /// Claim the terminal slot for `request_id`. False if already claimed.
    fn claim(&mut self, request_id: &str) -> bool {
        if self.finished.contains(request_id) {
            return false;
        }
        self.finished.insert(request_id.to_string());
        self.order.push_back(request_id.to_string());
        while self.order.len() > FINISHED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
        true
    }

    fn is_finished(&self, request_id: &str) -> bool {
        self.finished.contains(request_id)
    }
}

struct RouterInner {
    context: Mutex<HostContext>,
    ledger: Mutex<TerminalLedger>,
    inflight: Mutex<HashMap<String, CancellationToken>>,
    serve_task: Mutex<Option<AbortHandle>>,
}

/// Entry point inside the wallet context.
#[derive(Clone)]
pub struct RpcRouter {
    inner: Arc<RouterInner>,
}

impl RpcRouter {
    pub fn new(context: HostContext) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                context: Mutex::new(context),
                ledger: Mutex::new(TerminalLedger::default()),
                inflight: Mutex::new(HashMap::new()),
                serve_task: Mutex::new(None),
            }),
        }
    }

    /// Process window messages until the sender goes away.
    pub fn spawn(self, mut window: mpsc::UnboundedReceiver<WindowMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = window.recv().await {
                if let Err(e) = self.accept_window_message(message) {
                    tracing::debug!("Ignored window message: {}", e);
                }
            }
            self.teardown();
        })
    }

    /// Handle a message posted to the wallet context's window.
    ///
    /// Only `CONNECT` from the expected parent with a non-opaque origin and a
    /// transferred port is accepted; everything else is ignored.
    pub fn accept_window_message(&self, mut message: WindowMessage) -> Result<(), ChannelError> {
        if message.data.get("type").and_then(Value::as_str) != Some(TYPE_CONNECT) {
            return Err(ChannelError::HandshakeRejected {
                reason: "not a CONNECT message".to_string(),
            });
        }
        let port = {
            let mut context = self.inner.context.lock();
            if !message.source.is_same(context.parent()) {
                tracing::warn!(source = message.source.label(), "CONNECT from unexpected source");
                return Err(ChannelError::HandshakeRejected {
                    reason: "source is not the parent context".to_string(),
                });
            }
            if message.origin.is_empty() || message.origin == "null" {
                tracing::warn!("CONNECT from opaque origin");
                return Err(ChannelError::HandshakeRejected {
                    reason: "opaque origin".to_string(),
                });
            }
            let Some(port) = message.ports.pop() else {
                return Err(ChannelError::HandshakeRejected {
                    reason: "no port transferred".to_string(),
                });
            };
            context.adopt_channel(message.origin.clone(), port)
        };

        tracing::info!(origin = %message.origin, "Wallet host connected");
        self.post(&AppMessage::Ready {
            protocol_version: PROTOCOL_VERSION.to_string(),
        });

        let router = self.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = port.recv().await {
                router.dispatch(message.data);
            }
            tracing::debug!("App channel closed");
        });
        if let Some(previous) = self.inner.serve_task.lock().replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    /// Decode and route one inbound envelope. Never blocks on a handler.
    pub fn dispatch(&self, data: Value) {
        match decode_envelope(&data) {
            InboundEnvelope::Unknown { kind } => {
                tracing::debug!(kind = ?kind, "Ignoring unknown message type");
            }
            InboundEnvelope::Invalid {
                request_id,
                kind,
                reason,
            } => {
                tracing::debug!(kind = %kind, "Invalid request payload: {}", reason);
                if let Some(request_id) = request_id {
                    let error = Error::InvalidRequest(format!("{kind}: {reason}"));
                    self.finish_err(&request_id, &error);
                }
            }
            InboundEnvelope::Request {
                request_id,
                request,
            } => self.route(request_id, request),
        }
    }

    fn route(&self, request_id: Option<String>, request: HostRequest) {
        match request {
            HostRequest::Ping => {
                if let Ok(client) = self.inner.context.lock().client() {
                    client.prewarm();
                }
                self.post(&AppMessage::Pong { request_id });
            }
            HostRequest::SetConfig(patch) => {
                let outcome = self.inner.context.lock().reset_on_reconfigure(patch);
                if let Some(request_id) = request_id {
                    match outcome {
                        Ok(()) => self.finish_ok(&request_id, json!({ "configured": true })),
                        Err(e) => self.finish_err(&request_id, &Error::from(e)),
                    }
                }
            }
            HostRequest::Cancel { target } => self.cancel(request_id, target),
            request => {
                let Some(request_id) = request_id else {
                    tracing::debug!(kind = request.type_name(), "Request without requestId ignored");
                    return;
                };
                self.spawn_handler(request_id, request);
            }
        }
    }

    fn spawn_handler(&self, request_id: String, request: HostRequest) {
        if self.inner.ledger.lock().is_finished(&request_id)
            || self.inner.inflight.lock().contains_key(&request_id)
        {
            tracing::warn!(request_id = %request_id, "Duplicate requestId ignored");
            return;
        }

        let (client, preferences) = {
            let mut context = self.inner.context.lock();
            let preferences = Arc::clone(&context.env().preferences);
            let client: Result<Option<Arc<WalletClient>>, Error> = if handlers::needs_client(&request) {
                context.client().map(Some)
            } else {
                Ok(None)
            };
            (client, preferences)
        };
        let client = match client {
            Ok(client) => client,
            Err(e) => {
                self.finish_err(&request_id, &e);
                return;
            }
        };

        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        self.inner
            .inflight
            .lock()
            .insert(request_id.clone(), cancel.clone());

        let router = self.clone();
        let kind = request.type_name();
        tokio::spawn(async move {
            tracing::debug!(request_id = %request_id, kind, "Handling request");
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let scope = HandlerScope {
                client,
                preferences,
                progress: Progress::new(progress_tx),
                cancel,
            };

            let handler = handlers::handle(scope, request);
            tokio::pin!(handler);
            let outcome = loop {
                tokio::select! {
                    biased;
                    Some(payload) = progress_rx.recv() => {
                        if !cancelled.is_cancelled() {
                            router.progress(&request_id, payload);
                        }
                    }
                    outcome = &mut handler => break outcome,
                }
            };

            // Cancellation happens under the inflight lock, so once the id is
            // gone nobody else can claim this request's terminal.
            router.inner.inflight.lock().remove(&request_id);
            if cancelled.is_cancelled() {
                tracing::debug!(request_id = %request_id, kind, "Cancelled request exited");
                return;
            }
            while let Ok(payload) = progress_rx.try_recv() {
                router.progress(&request_id, payload);
            }
            match outcome {
                Ok(result) => router.finish_ok(&request_id, result),
                Err(e) => {
                    tracing::debug!(request_id = %request_id, kind, "Request failed: {}", e);
                    router.finish_err(&request_id, &e);
                }
            }
        });
    }

    /// Cancel `target`, or everything in flight when no target is given.
    ///
    /// Tokens stay registered until their handler exits so the id keeps
    /// counting as in flight for duplicate suppression.
    fn cancel(&self, request_id: Option<String>, target: Option<String>) {
        let (cancelled, target_in_flight) = {
            let inflight = self.inner.inflight.lock();
            let target_in_flight = target.as_ref().is_some_and(|t| inflight.contains_key(t));
            let cancelled: Vec<String> = inflight
                .iter()
                .filter(|(id, token)| {
                    !token.is_cancelled() && target.as_ref().is_none_or(|target| target == *id)
                })
                .map(|(id, token)| {
                    token.cancel();
                    id.clone()
                })
                .collect();
            (cancelled, target_in_flight)
        };

        {
            let context = self.inner.context.lock();
            context.env().confirm.cancel_active();
            if let Some(client) = context.existing_client() {
                client.stop_pairing();
            }
        }

        let mut terminal_ids = cancelled.clone();
        if let Some(target) = &target
            && !target_in_flight
        {
            terminal_ids.push(target.clone());
        }
        for id in &terminal_ids {
            self.finish(
                id,
                AppMessage::Error {
                    request_id: Some(id.clone()),
                    payload: ErrorPayload::cancelled(),
                },
            );
        }
        tracing::info!(count = cancelled.len(), "Requests cancelled");

        if let Some(request_id) = request_id {
            self.finish_ok(&request_id, json!({ "cancelled": cancelled }));
        }
    }

    fn progress(&self, request_id: &str, payload: Value) {
        if self.inner.ledger.lock().is_finished(request_id) {
            return;
        }
        self.post(&AppMessage::Progress {
            request_id: request_id.to_string(),
            payload,
        });
    }

    fn finish_ok(&self, request_id: &str, result: Value) {
        self.finish(
            request_id,
            AppMessage::Result {
                request_id: request_id.to_string(),
                payload: ResultPayload { ok: true, result },
            },
        );
    }

    fn finish_err(&self, request_id: &str, error: &Error) {
        self.finish(
            request_id,
            AppMessage::Error {
                request_id: Some(request_id.to_string()),
                payload: error.to_error_payload(),
            },
        );
    }

    fn finish(&self, request_id: &str, message: AppMessage) {
        if !self.inner.ledger.lock().claim(request_id) {
            tracing::debug!(request_id, "Suppressed duplicate terminal envelope");
            return;
        }
        self.post(&message);
    }

    fn post(&self, message: &AppMessage) {
        let Some(port) = self.inner.context.lock().port() else {
            tracing::debug!("No app channel; dropping outbound message");
            return;
        };
        match serde_json::to_value(message) {
            Ok(data) => {
                if let Err(e) = port.post_json(data) {
                    tracing::debug!("Failed to post to app: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode outbound message: {}", e),
        }
    }

    /// Whether a terminal envelope has been sent for `request_id`.
    pub fn is_finished(&self, request_id: &str) -> bool {
        self.inner.ledger.lock().is_finished(request_id)
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    pub fn with_context<R>(&self, f: impl FnOnce(&mut HostContext) -> R) -> R {
        f(&mut self.inner.context.lock())
    }

    pub fn teardown(&self) {
        for token in self.inner.inflight.lock().values() {
            token.cancel();
        }
        if let Some(task) = self.inner.serve_task.lock().take() {
            task.abort();
        }
        self.inner.context.lock().teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_is_first_wins() {
        let mut ledger = TerminalLedger::default();
        assert!(ledger.claim("r1"));
        assert!(!ledger.claim("r1"));
        assert!(ledger.is_finished("r1"));
    }

    #[test]
    fn ledger_is_bounded() {
        let mut ledger = TerminalLedger::default();
        for i in 0..(FINISHED_CAPACITY + 10) {
            ledger.claim(&format!("r{i}"));
        }
        assert_eq!(ledger.finished.len(), FINISHED_CAPACITY);
        assert!(!ledger.is_finished("r0"));
        assert!(ledger.is_finished(&format!("r{}", FINISHED_CAPACITY + 9)));
    }
}
