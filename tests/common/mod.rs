//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

use passkey_host::channel::{ContextRef, MessageChannel, Port};
use passkey_host::client::ClientEnvironment;
use passkey_host::client::chain::{
    AccessKeyInfo, AccessKeyView, BlockInfo, ChainClient, TransactionOutcome,
};
use passkey_host::config::{ConfirmUiMode, HostConfigPatch};
use passkey_host::confirm::{
    ConfirmEvent, ConfirmProps, ConfirmSurfaceFactory, MountedSurface, SurfaceRegistry,
};
use passkey_host::error::ChainError;
use passkey_host::host::{HostContext, RpcRouter, WindowMessage};
use passkey_host::protocol::SignedTransaction;

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const APP_ORIGIN: &str = "https://app.example";
pub const WALLET_HOST: &str = "wallet.example";

/// Chain double: every key exists unless `keys_missing`, every broadcast succeeds.
///
/// When `key_list_gate` is set, key list lookups block until it is notified
/// and ignore cancellation while they wait.
#[derive(Default)]
pub struct MockChain {
    pub nonce: AtomicU64,
    pub keys_missing: AtomicBool,
    pub sent: Mutex<Vec<SignedTransaction>>,
    pub key_list_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockChain {
    fn block() -> BlockInfo {
        BlockInfo {
            height: 1_000,
            hash: "4reLvkAWfqk5fsqio1KLudk46cqRz9erQdaHkWZKMJDZ".to_string(),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn latest_block(&self) -> Result<BlockInfo, ChainError> {
        Ok(Self::block())
    }

    async fn view_access_key(
        &self,
        _account_id: &str,
        public_key: &str,
    ) -> Result<AccessKeyView, ChainError> {
        if self.keys_missing.load(Ordering::SeqCst) {
            return Err(ChainError::Rpc {
                method: "query".to_string(),
                message: format!("access key {public_key} does not exist"),
            });
        }
        Ok(AccessKeyView {
            nonce: self.nonce.load(Ordering::SeqCst),
            block: Self::block(),
        })
    }

    async fn view_access_key_list(&self, _account_id: &str) -> Result<Vec<AccessKeyInfo>, ChainError> {
        let gate = self.key_list_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(Vec::new())
    }

    async fn send_transaction(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<TransactionOutcome, ChainError> {
        self.sent.lock().push(transaction.clone());
        Ok(TransactionOutcome {
            transaction_hash: transaction.hash.clone(),
            status: json!({ "SuccessValue": "" }),
        })
    }
}

/// What a scripted surface does as soon as it is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Confirm,
    Cancel,
    Hold,
}

/// Surface binding that answers according to a script and counts mounts.
pub struct ScriptedSurfaces {
    script: Mutex<Script>,
    mounted: Arc<AtomicUsize>,
    max_mounted: Arc<AtomicUsize>,
    total: AtomicUsize,
    pub last_props: Mutex<Option<ConfirmProps>>,
    held: Mutex<Vec<mpsc::UnboundedSender<ConfirmEvent>>>,
}

impl ScriptedSurfaces {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            mounted: Arc::new(AtomicUsize::new(0)),
            max_mounted: Arc::new(AtomicUsize::new(0)),
            total: AtomicUsize::new(0),
            last_props: Mutex::new(None),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn mounted(&self) -> usize {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn max_mounted(&self) -> usize {
        self.max_mounted.load(Ordering::SeqCst)
    }

    pub fn total_mounts(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn registry(self: &Arc<Self>) -> SurfaceRegistry {
        let mut registry = SurfaceRegistry::new();
        registry.register(ConfirmUiMode::Modal, Arc::clone(self) as Arc<dyn ConfirmSurfaceFactory>);
        registry
    }
}

struct ScriptedMount {
    mounted: Arc<AtomicUsize>,
    released: std::sync::atomic::AtomicBool,
}

impl MountedSurface for ScriptedMount {
    fn update(&self, _props: &ConfirmProps) {}

    fn unmount(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.mounted.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl ConfirmSurfaceFactory for ScriptedSurfaces {
    fn mount(
        &self,
        props: &ConfirmProps,
        events: mpsc::UnboundedSender<ConfirmEvent>,
    ) -> Box<dyn MountedSurface> {
        let now = self.mounted.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_mounted.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.last_props.lock() = Some(props.clone());
        match *self.script.lock() {
            Script::Confirm => {
                let _ = events.send(ConfirmEvent::Confirm { error: None });
            }
            Script::Cancel => {
                let _ = events.send(ConfirmEvent::Cancel {
                    error: Some("user declined".to_string()),
                });
            }
            Script::Hold => self.held.lock().push(events),
        }
        Box::new(ScriptedMount {
            mounted: Arc::clone(&self.mounted),
            released: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

pub fn base_config() -> HostConfigPatch {
    HostConfigPatch {
        near_rpc_url: Some("https://rpc.testnet.near.org".to_string()),
        contract_id: Some("w3a-v1.testnet".to_string()),
        ..HostConfigPatch::default()
    }
}

pub fn environment(surfaces: &Arc<ScriptedSurfaces>, chain: &Arc<MockChain>) -> ClientEnvironment {
    let mut env = ClientEnvironment::in_process(WALLET_HOST, surfaces.registry());
    env.chain = Some(Arc::clone(chain) as Arc<dyn ChainClient>);
    env
}

/// A running host plus the application's end of its channel.
pub struct Harness {
    pub parent: ContextRef,
    pub router: RpcRouter,
    pub window: mpsc::UnboundedSender<WindowMessage>,
    pub app: Port,
    pub surfaces: Arc<ScriptedSurfaces>,
    pub chain: Arc<MockChain>,
}

impl Harness {
    pub async fn connect(script: Script, base: HostConfigPatch) -> Self {
        let surfaces = ScriptedSurfaces::new(script);
        let chain = Arc::new(MockChain::default());
        let parent = ContextRef::new("app");
        let context = HostContext::create(parent.clone(), base, environment(&surfaces, &chain));
        let router = RpcRouter::new(context);
        let (window, window_rx) = mpsc::unbounded_channel();
        router.clone().spawn(window_rx);

        let (app, host_side) = MessageChannel::new().into_ports();
        window
            .send(
                WindowMessage::new(parent.clone(), APP_ORIGIN, json!({ "type": "CONNECT" }))
                    .with_port(host_side),
            )
            .unwrap();

        let ready = recv(&app).await;
        assert_eq!(ready["type"], "READY");

        Self {
            parent,
            router,
            window,
            app,
            surfaces,
            chain,
        }
    }

    pub fn send(&self, kind: &str, request_id: &str, payload: Value) {
        self.app
            .post_json(json!({ "type": kind, "requestId": request_id, "payload": payload }))
            .unwrap();
    }

    /// Collect messages until the terminal envelope for `request_id`.
    ///
    /// Returns the progress payloads seen for that id and the terminal.
    pub async fn until_terminal(&self, request_id: &str) -> (Vec<Value>, Value) {
        let mut progress = Vec::new();
        loop {
            let message = recv(&self.app).await;
            if message["requestId"] != request_id {
                continue;
            }
            match message["type"].as_str() {
                Some("PROGRESS") => progress.push(message["payload"].clone()),
                Some("PM_RESULT") | Some("ERROR") => return (progress, message),
                _ => {}
            }
        }
    }

    /// Send a request and wait for its terminal envelope.
    pub async fn call(&self, kind: &str, request_id: &str, payload: Value) -> Value {
        self.send(kind, request_id, payload);
        self.until_terminal(request_id).await.1
    }
}

pub async fn recv(port: &Port) -> Value {
    timeout(TIMEOUT, port.recv())
        .await
        .expect("timed out waiting for host message")
        .expect("host closed the channel")
        .data
}

/// Drain whatever arrives within `window`.
pub async fn drain(port: &Port, window: Duration) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Ok(Some(message)) = timeout(window, port.recv()).await {
        messages.push(message.data);
    }
    messages
}
