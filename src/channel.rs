//! In-process message channels between execution contexts.
//!
//! A [`MessageChannel`] yields two entangled [`Port`]s. Messages posted on one
//! port arrive, in order, on the other. Ports can be moved inside a message
//! (the transfer list), which is how a private endpoint travels from the
//! orchestrator into a worker without the orchestrator ever reading from it.
//! Closing a port, or dropping it, ends the peer's receive stream.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Structured payload plus any ports transferred with it.
pub struct PortMessage {
    pub data: serde_json::Value,
    pub ports: Vec<Port>,
}

impl PortMessage {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: Port) -> Self {
        self.ports.push(port);
        self
    }

    /// The `type` discriminator, if the payload carries one.
    pub fn kind(&self) -> Option<&str> {
        self.data.get("type").and_then(|v| v.as_str())
    }
}

impl fmt::Debug for PortMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortMessage")
            .field("type", &self.kind())
            .field("ports", &self.ports.len())
            .finish()
    }
}

/// One end of a [`MessageChannel`].
pub struct Port {
    id: u64,
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<PortMessage>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PortMessage>>,
    closed: CancellationToken,
}

/// Closes a port from outside, after the port itself has been transferred.
#[derive(Clone)]
pub struct PortCloser {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<PortMessage>>>>,
    closed: CancellationToken,
}

impl PortCloser {
    pub fn close(&self) {
        self.closed.cancel();
        self.tx.lock().take();
    }
}

impl fmt::Debug for PortCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortCloser")
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Port {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn post(&self, message: PortMessage) -> Result<(), ChannelError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(ChannelError::Closed { port_id: self.id });
        };
        tx.send(message)
            .map_err(|_| ChannelError::Closed { port_id: self.id })
    }

    pub fn post_json(&self, data: serde_json::Value) -> Result<(), ChannelError> {
        self.post(PortMessage::new(data))
    }

    /// Next message from the peer. `None` once either side has closed.
    pub async fn recv(&self) -> Option<PortMessage> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            message = rx.recv() => message,
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
        self.tx.lock().take();
    }

    pub fn closer(&self) -> PortCloser {
        PortCloser {
            tx: Arc::clone(&self.tx),
            closed: self.closed.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A pair of entangled ports.
#[derive(Debug)]
pub struct MessageChannel {
    pub port1: Port,
    pub port2: Port,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        Self {
            port1: Port {
                id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
                tx: Arc::new(Mutex::new(Some(tx2))),
                rx: tokio::sync::Mutex::new(rx1),
                closed: CancellationToken::new(),
            },
            port2: Port {
                id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
                tx: Arc::new(Mutex::new(Some(tx1))),
                rx: tokio::sync::Mutex::new(rx2),
                closed: CancellationToken::new(),
            },
        }
    }

    pub fn into_ports(self) -> (Port, Port) {
        (self.port1, self.port2)
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque identity of a browsing context.
///
/// Two refs are the same context only if they share the allocation; an equal
/// origin string is not enough.
#[derive(Clone)]
pub struct ContextRef(Arc<ContextMarker>);

struct ContextMarker {
    label: String,
}

impl ContextRef {
    pub fn new(label: impl Into<String>) -> Self {
        Self(Arc::new(ContextMarker {
            label: label.into(),
        }))
    }

    pub fn is_same(&self, other: &ContextRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextRef").field(&self.0.label).finish()
    }
}
