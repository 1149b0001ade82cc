//! The wallet host: handshake, router and per-context state.

pub mod context;
pub mod handlers;
pub mod router;

pub use context::HostContext;
pub use router::RpcRouter;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ContextRef, Port};
use crate::client::ClientEnvironment;
use crate::config::StartupConfig;
use crate::error::ConfigError;
use crate::observability;

/// A message posted to the wallet context's window.
pub struct WindowMessage {
    /// Context that posted the message.
    pub source: ContextRef,
    /// Serialized origin of the poster; `"null"` for opaque origins.
    pub origin: String,
    pub data: Value,
    pub ports: Vec<Port>,
}

impl WindowMessage {
    pub fn new(source: ContextRef, origin: impl Into<String>, data: Value) -> Self {
        Self {
            source,
            origin: origin.into(),
            data,
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: Port) -> Self {
        self.ports.push(port);
        self
    }
}

impl std::fmt::Debug for WindowMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowMessage")
            .field("source", &self.source)
            .field("origin", &self.origin)
            .field("type", &self.data.get("type"))
            .field("ports", &self.ports.len())
            .finish()
    }
}

/// Load the env layer, install logging and serve `window` until it closes.
///
/// `parent` is the only context whose `CONNECT` will be accepted.
pub fn launch(
    parent: ContextRef,
    env: ClientEnvironment,
    window: mpsc::UnboundedReceiver<WindowMessage>,
) -> Result<JoinHandle<()>, ConfigError> {
    let startup = StartupConfig::load()?;
    observability::init_tracing(&startup.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = crate::protocol::PROTOCOL_VERSION,
        "Wallet host starting"
    );
    let context = HostContext::create(parent, startup.base, env);
    Ok(RpcRouter::new(context).spawn(window))
}
