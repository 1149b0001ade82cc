//! WebAuthn ceremony adapter.
//!
//! Runs credential creation (registration) and assertion (authentication)
//! with two PRF evaluations whose salts are scoped to the account and labeled
//! by purpose. A ceremony that the local context may not run is retried in an
//! ancestor context. Every ceremony can be aborted by the caller or by the
//! page going away, and drops its page listener when it finishes.

mod software;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretSlice;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::CeremonyError;
use crate::worker::crypto;

pub use self::software::SoftwareAuthenticator;

/// Salt label for the PRF output that seeds the key-encryption key.
pub const CIPHER_SALT_LABEL: &str = "chacha20-salt:";
/// Salt label for the PRF output that seeds the signing key.
pub const SIGNING_SALT_LABEL: &str = "ed25519-salt:";

pub const DEFAULT_CEREMONY_TIMEOUT: Duration = Duration::from_secs(60);

/// The two PRF salts for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrfSalts {
    pub first: [u8; 32],
    pub second: [u8; 32],
}

impl PrfSalts {
    pub fn for_account(account_id: &str) -> Self {
        Self {
            first: Sha256::digest(format!("{CIPHER_SALT_LABEL}{account_id}")).into(),
            second: Sha256::digest(format!("{SIGNING_SALT_LABEL}{account_id}")).into(),
        }
    }
}

/// Relying-party id: the override if the current host is it or sits under
/// it, otherwise the current host.
pub fn resolve_rp_id(current_host: &str, rp_id_override: Option<&str>) -> String {
    let host = current_host.trim().to_ascii_lowercase();
    match rp_id_override.map(|o| o.trim().trim_start_matches('.').to_ascii_lowercase()) {
        Some(candidate)
            if !candidate.is_empty()
                && (host == candidate || host.ends_with(&format!(".{candidate}"))) =>
        {
            candidate
        }
        Some(candidate) => {
            tracing::warn!(
                rp_id = %candidate,
                host = %host,
                "rpId override is not a suffix of the current host; using the host"
            );
            host
        }
        None => host,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CeremonyKind {
    Create,
    Get,
}

/// Input to a platform ceremony.
#[derive(Debug, Clone)]
pub struct CeremonyRequest {
    pub kind: CeremonyKind,
    pub rp_id: String,
    pub user_id: String,
    pub challenge: Vec<u8>,
    pub salts: PrfSalts,
    /// Credential ids the assertion may use. Empty means discoverable.
    pub allow_credentials: Vec<String>,
    pub timeout: Duration,
}

/// The two PRF results. Never serialized.
pub struct PrfOutputs {
    pub first: SecretSlice<u8>,
    pub second: Option<SecretSlice<u8>>,
}

impl std::fmt::Debug for PrfOutputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrfOutputs")
            .field("second", &self.second.is_some())
            .finish_non_exhaustive()
    }
}

/// What a platform authenticator hands back.
#[derive(Debug)]
pub struct CeremonyCredential {
    pub kind: CeremonyKind,
    pub id: String,
    /// Account the credential was created for.
    pub user_handle: Option<String>,
    pub client_data_json: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    /// Assertion signature; `None` for creation.
    pub signature: Option<Vec<u8>>,
    /// `ed25519:` public key; present on creation.
    pub public_key: Option<String>,
    pub prf: Option<PrfOutputs>,
}

/// Transport form of a credential. PRF outputs are stripped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SerializedCredential {
    pub id: String,
    pub raw_id: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    pub response: SerializedResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SerializedResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    pub authenticator_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl CeremonyCredential {
    pub fn to_transport(&self) -> SerializedCredential {
        SerializedCredential {
            id: self.id.clone(),
            raw_id: self.id.clone(),
            credential_type: "public-key".to_string(),
            response: SerializedResponse {
                client_data_json: crypto::b64u_encode(&self.client_data_json),
                authenticator_data: crypto::b64u_encode(&self.authenticator_data),
                signature: self.signature.as_deref().map(crypto::b64u_encode),
                user_handle: self.user_handle.clone(),
                public_key: self.public_key.clone(),
            },
        }
    }
}

/// A credential API reachable from some browsing context.
#[async_trait]
pub trait PlatformAuthenticator: Send + Sync {
    async fn create(&self, request: &CeremonyRequest) -> Result<CeremonyCredential, CeremonyError>;

    async fn get(&self, request: &CeremonyRequest) -> Result<CeremonyCredential, CeremonyError>;
}

/// Page visibility as seen by the wallet context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Visible,
    Hidden,
    Navigated,
}

/// Broadcasts page lifecycle changes to running ceremonies.
#[derive(Clone)]
pub struct PageLifecycle {
    tx: Arc<watch::Sender<PageState>>,
}

impl PageLifecycle {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(PageState::Visible)),
        }
    }

    pub fn set(&self, state: PageState) {
        self.tx.send_replace(state);
    }

    pub fn state(&self) -> PageState {
        *self.tx.borrow()
    }

    /// Number of ceremonies currently listening.
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> watch::Receiver<PageState> {
        self.tx.subscribe()
    }
}

impl Default for PageLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

async fn page_left(rx: &mut watch::Receiver<PageState>) -> &'static str {
    loop {
        match *rx.borrow_and_update() {
            PageState::Hidden => return "page hidden",
            PageState::Navigated => return "page navigated",
            PageState::Visible => {}
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Successful ceremony plus the PRF outputs it produced.
#[derive(Debug)]
pub struct CeremonyOutcome {
    pub credential: CeremonyCredential,
    pub prf: PrfOutputs,
}

pub struct WebAuthnManager {
    local: Arc<dyn PlatformAuthenticator>,
    ancestor: Option<Arc<dyn PlatformAuthenticator>>,
    current_host: String,
    rp_id_override: Option<String>,
    secure_context: bool,
    lifecycle: PageLifecycle,
    timeout: Duration,
}

impl WebAuthnManager {
    pub fn new(local: Arc<dyn PlatformAuthenticator>, current_host: impl Into<String>) -> Self {
        Self {
            local,
            ancestor: None,
            current_host: current_host.into(),
            rp_id_override: None,
            secure_context: true,
            lifecycle: PageLifecycle::new(),
            timeout: DEFAULT_CEREMONY_TIMEOUT,
        }
    }

    pub fn with_ancestor(mut self, ancestor: Arc<dyn PlatformAuthenticator>) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn with_rp_id_override(mut self, rp_id: Option<String>) -> Self {
        self.rp_id_override = rp_id;
        self
    }

    pub fn with_secure_context(mut self, secure: bool) -> Self {
        self.secure_context = secure;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: PageLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rp_id(&self) -> String {
        resolve_rp_id(&self.current_host, self.rp_id_override.as_deref())
    }

    pub fn is_secure_context(&self) -> bool {
        self.secure_context
    }

    pub fn lifecycle(&self) -> &PageLifecycle {
        &self.lifecycle
    }

    /// Registration ceremony. Both PRF outputs are required.
    pub async fn create_credential(
        &self,
        account_id: &str,
        challenge: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        let request = self.request(CeremonyKind::Create, account_id, challenge, Vec::new());
        let outcome = self.run(&request, cancel).await?;
        if outcome.prf.second.is_none() {
            return Err(CeremonyError::MissingPrfOutputs);
        }
        Ok(outcome)
    }

    /// Authentication ceremony. An empty `allow_credentials` lets the user
    /// pick any credential for this relying party.
    pub async fn get_credential(
        &self,
        account_id: &str,
        challenge: Vec<u8>,
        allow_credentials: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        let request = self.request(CeremonyKind::Get, account_id, challenge, allow_credentials);
        self.run(&request, cancel).await
    }

    fn request(
        &self,
        kind: CeremonyKind,
        account_id: &str,
        challenge: Vec<u8>,
        allow_credentials: Vec<String>,
    ) -> CeremonyRequest {
        CeremonyRequest {
            kind,
            rp_id: self.rp_id(),
            user_id: account_id.to_string(),
            challenge,
            salts: PrfSalts::for_account(account_id),
            allow_credentials,
            timeout: self.timeout,
        }
    }

    async fn run(
        &self,
        request: &CeremonyRequest,
        cancel: &CancellationToken,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        if !self.secure_context {
            return Err(CeremonyError::InsecureContext);
        }
        if cancel.is_cancelled() {
            return Err(CeremonyError::Aborted {
                reason: "cancelled".to_string(),
            });
        }

        // Dropped on every exit path below, releasing the page listener.
        let mut page = self.lifecycle.subscribe();

        let ceremony = async {
            match invoke(self.local.as_ref(), request).await {
                Err(CeremonyError::ContextNotPermitted) => match &self.ancestor {
                    Some(ancestor) => {
                        tracing::debug!(kind = ?request.kind, "Retrying ceremony in ancestor context");
                        invoke(ancestor.as_ref(), request).await
                    }
                    None => Err(CeremonyError::ContextNotPermitted),
                },
                other => other,
            }
        };

        let credential = tokio::select! {
            _ = cancel.cancelled() => Err(CeremonyError::Aborted { reason: "cancelled".to_string() }),
            reason = page_left(&mut page) => Err(CeremonyError::Aborted { reason: reason.to_string() }),
            result = tokio::time::timeout(request.timeout, ceremony) => {
                result.unwrap_or(Err(CeremonyError::Timeout(request.timeout)))
            }
        };
        let mut credential = credential?;
        let prf = credential.prf.take().ok_or(CeremonyError::MissingPrfOutputs)?;
        Ok(CeremonyOutcome { credential, prf })
    }
}

async fn invoke(
    authenticator: &dyn PlatformAuthenticator,
    request: &CeremonyRequest,
) -> Result<CeremonyCredential, CeremonyError> {
    match request.kind {
        CeremonyKind::Create => authenticator.create(request).await,
        CeremonyKind::Get => authenticator.get(request).await,
    }
}
