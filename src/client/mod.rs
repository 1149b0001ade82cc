//! Wallet client.
//!
//! Composes the worker pool, VRF worker, ceremony adapter, confirmation gate,
//! chain RPC and account store into the operations the host exposes. One
//! client exists per resolved configuration; reconfiguring builds a new one.

pub mod chain;
pub mod preferences;
pub mod relay;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfirmUiMode, HostConfig};
use crate::confirm::{ConfirmRequest, ConfirmUiController, SurfaceRegistry};
use crate::error::{CeremonyError, ConfirmError, Error, Result, WorkerError};
use crate::protocol::PROTOCOL_VERSION;
use crate::protocol::transaction::{
    AccessKeyArgs, AccessKeyPermission, ActionArgs, SignedTransaction, TransactionInput,
};
use crate::protocol::worker::{
    DecryptKeyRequest, DecryptedKeypair, DeriveKeypairRequest, DerivedKeypair, SignNep413Request,
    SignTransactionsRequest, SignWithKeyPairRequest, SignedMessage, SignedTransactions,
    VrfChallenge, VrfInputData, WorkerRequest,
};
use crate::webauthn::{
    CeremonyOutcome, PageLifecycle, PlatformAuthenticator, SerializedCredential,
    SoftwareAuthenticator, WebAuthnManager,
};
use crate::worker::queue::ProgressSender;
use crate::worker::{
    InProcessSignerSpawner, InProcessVrfSpawner, SignerWorkerPool, VrfWorkerHandle, WorkerSpawner,
    crypto,
};

use self::chain::{AccessKeyInfo, BlockInfo, ChainClient, NearRpcClient, TransactionOutcome};
use self::preferences::PreferenceStore;
use self::relay::{AccountRelay, CreateAccountRequest, HttpRelay};
use self::store::{AccountRecord, AccountStore, InMemoryAccountStore, LoginState};

/// Polling cadence for device linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPolling {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LinkPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Collaborators that outlive any single client.
#[derive(Clone)]
pub struct ClientEnvironment {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub vrf_spawner: Arc<dyn WorkerSpawner>,
    pub authenticator: Arc<dyn PlatformAuthenticator>,
    pub ancestor_authenticator: Option<Arc<dyn PlatformAuthenticator>>,
    pub current_host: String,
    pub secure_context: bool,
    pub lifecycle: PageLifecycle,
    pub store: Arc<dyn AccountStore>,
    pub preferences: Arc<PreferenceStore>,
    pub confirm: Arc<ConfirmUiController>,
    /// Replaces the JSON-RPC client built from `near_rpc_url`.
    pub chain: Option<Arc<dyn ChainClient>>,
    /// Replaces the HTTP relay built from `relayer_url`.
    pub relay: Option<Arc<dyn AccountRelay>>,
    pub link_polling: LinkPolling,
}

impl ClientEnvironment {
    /// In-process workers, software authenticator and a volatile store.
    pub fn in_process(current_host: impl Into<String>, surfaces: SurfaceRegistry) -> Self {
        Self {
            spawner: Arc::new(InProcessSignerSpawner),
            vrf_spawner: Arc::new(InProcessVrfSpawner),
            authenticator: Arc::new(SoftwareAuthenticator::new()),
            ancestor_authenticator: None,
            current_host: current_host.into(),
            secure_context: true,
            lifecycle: PageLifecycle::new(),
            store: Arc::new(InMemoryAccountStore::new()),
            preferences: Arc::new(PreferenceStore::default()),
            confirm: Arc::new(ConfirmUiController::new(surfaces)),
            chain: None,
            relay: None,
            link_polling: LinkPolling::default(),
        }
    }
}

/// Progress reporting for one request.
#[derive(Clone, Default)]
pub struct Progress(Option<ProgressSender>);

impl Progress {
    pub fn new(tx: ProgressSender) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    fn step(&self, step: &str, extra: Value) {
        if let Some(tx) = &self.0 {
            let mut payload = json!({ "step": step });
            if let (Some(map), Value::Object(extra)) = (payload.as_object_mut(), extra) {
                map.extend(extra);
            }
            let _ = tx.send(payload);
        }
    }

    fn sender(&self) -> Option<ProgressSender> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResult {
    pub near_account_id: String,
    pub public_key: String,
    pub credential: SerializedCredential,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignAndSendResult {
    pub transactions: Vec<SignedTransaction>,
    pub outcomes: Vec<TransactionOutcome>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDeviceResult {
    pub near_account_id: String,
    pub public_key: String,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub protocol_version: &'static str,
    pub prf: bool,
    pub secure_context: bool,
    pub rp_id: String,
    pub confirm_ui_modes: Vec<&'static str>,
    pub relay: bool,
    pub worker_pool_capacity: usize,
}

/// Ends the session on every exit path.
struct SessionGuard<'a> {
    client: &'a WalletClient,
    session_id: String,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(vrf) = self.client.vrf.get() {
            vrf.fail_session(&self.session_id, "signing session ended");
        }
        self.client.pool.release_session(&self.session_id);
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(operation: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        WorkerError::OperationFailed {
            operation: operation.to_string(),
            reason: format!("unexpected result shape: {e}"),
        }
        .into()
    })
}

fn ceremony_error(cancel: &CancellationToken, err: CeremonyError) -> Error {
    if cancel.is_cancelled() {
        Error::Cancelled
    } else {
        err.into()
    }
}

pub struct WalletClient {
    config: HostConfig,
    pool: SignerWorkerPool,
    vrf_spawner: Arc<dyn WorkerSpawner>,
    /// Started on first use.
    vrf: tokio::sync::OnceCell<VrfWorkerHandle>,
    webauthn: WebAuthnManager,
    confirm: Arc<ConfirmUiController>,
    store: Arc<dyn AccountStore>,
    preferences: Arc<PreferenceStore>,
    chain: Arc<dyn ChainClient>,
    relay: Option<Arc<dyn AccountRelay>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    pairing: Mutex<Option<CancellationToken>>,
    link_polling: LinkPolling,
}

impl WalletClient {
    /// Build a client for `config`. Must be called inside a tokio runtime.
    pub fn new(config: HostConfig, env: &ClientEnvironment) -> Result<Self> {
        let chain: Arc<dyn ChainClient> = match &env.chain {
            Some(chain) => Arc::clone(chain),
            None => Arc::new(NearRpcClient::new(&config.near_rpc_url)?),
        };
        let relay: Option<Arc<dyn AccountRelay>> = match (&env.relay, &config.relayer_url) {
            (Some(relay), _) => Some(Arc::clone(relay)),
            (None, Some(url)) => Some(Arc::new(HttpRelay::new(url)?)),
            (None, None) => None,
        };

        let mut webauthn = WebAuthnManager::new(Arc::clone(&env.authenticator), &env.current_host)
            .with_rp_id_override(config.rp_id_override.clone())
            .with_secure_context(env.secure_context)
            .with_lifecycle(env.lifecycle.clone());
        if let Some(ancestor) = &env.ancestor_authenticator {
            webauthn = webauthn.with_ancestor(Arc::clone(ancestor));
        }

        let pool = SignerWorkerPool::new(config.pool, Arc::clone(&env.spawner));
        let sweeper = pool.start_sweeper();
        tracing::info!(
            rp_id = %webauthn.rp_id(),
            capacity = config.pool.capacity,
            "Wallet client constructed"
        );

        Ok(Self {
            config,
            pool,
            vrf_spawner: Arc::clone(&env.vrf_spawner),
            vrf: tokio::sync::OnceCell::new(),
            webauthn,
            confirm: Arc::clone(&env.confirm),
            store: Arc::clone(&env.store),
            preferences: Arc::clone(&env.preferences),
            chain,
            relay,
            sweeper: Mutex::new(Some(sweeper)),
            pairing: Mutex::new(None),
            link_polling: env.link_polling,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn pool(&self) -> &SignerWorkerPool {
        &self.pool
    }

    pub fn rp_id(&self) -> String {
        self.webauthn.rp_id()
    }

    /// Start filling the worker pool without waiting.
    pub fn prewarm(&self) {
        self.pool.prewarm();
    }

    /// Stop any running device-linking poll.
    pub fn stop_pairing(&self) {
        if let Some(token) = self.pairing.lock().take() {
            token.cancel();
        }
    }

    pub fn shutdown(&self) {
        self.stop_pairing();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        if let Some(vrf) = self.vrf.get() {
            vrf.terminate();
        }
        self.pool.shutdown();
        tracing::debug!("Wallet client shut down");
    }

    async fn vrf(&self) -> Result<&VrfWorkerHandle> {
        self.vrf
            .get_or_try_init(|| {
                VrfWorkerHandle::start(
                    self.vrf_spawner.as_ref(),
                    self.config.pool.health_check_timeout,
                )
            })
            .await
    }

    async fn open_session(&self) -> Result<SessionGuard<'_>> {
        let vrf = self.vrf().await?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let seed_port = self.pool.reserve_session(&session_id).await?;
        let session = SessionGuard {
            client: self,
            session_id,
        };
        vrf.attach_seed_port(&session.session_id, seed_port).await?;
        Ok(session)
    }

    async fn challenge(
        &self,
        user_id: &str,
        session_id: &str,
        block: &BlockInfo,
    ) -> Result<VrfChallenge> {
        self.vrf()
            .await?
            .generate_challenge(VrfInputData {
                user_id: user_id.to_string(),
                rp_id: self.rp_id(),
                session_id: session_id.to_string(),
                block_height: block.height,
                block_hash: block.hash.clone(),
            })
            .await
    }

    fn challenge_bytes(challenge: &VrfChallenge) -> Result<Vec<u8>> {
        challenge.challenge_bytes().map_err(|e| {
            WorkerError::OperationFailed {
                operation: "VRF_CHALLENGE".to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn require_account(&self, account_id: &str) -> Result<AccountRecord> {
        self.store
            .get(account_id)
            .await
            .ok_or_else(|| Error::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    async fn assert_credential(
        &self,
        record: &AccountRecord,
        session: &SessionGuard<'_>,
        block: &BlockInfo,
        cancel: &CancellationToken,
    ) -> Result<CeremonyOutcome> {
        let challenge = self.challenge(&record.account_id, &session.session_id, block).await?;
        let outcome = self
            .webauthn
            .get_credential(
                &record.account_id,
                Self::challenge_bytes(&challenge)?,
                vec![record.credential_id.clone()],
                cancel,
            )
            .await
            .map_err(|e| ceremony_error(cancel, e))?;
        self.vrf()
            .await?
            .deliver_wrap_key_seed(
                &session.session_id,
                &record.account_id,
                &outcome.prf.first,
                Some(&record.encrypted.wrap_key_salt),
                None,
            )
            .await?;
        Ok(outcome)
    }

    pub async fn register(
        &self,
        account_id: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<RegisterResult> {
        if self.store.get(account_id).await.is_some() {
            return Err(Error::InvalidRequest(format!(
                "{account_id} is already registered on this device"
            )));
        }
        progress.step("preparing", json!({ "nearAccountId": account_id }));
        let session = self.open_session().await?;
        let block = self.chain.latest_block().await?;
        let challenge = self.challenge(account_id, &session.session_id, &block).await?;
        ensure_active(cancel)?;

        progress.step("webauthn", Value::Null);
        let outcome = self
            .webauthn
            .create_credential(account_id, Self::challenge_bytes(&challenge)?, cancel)
            .await
            .map_err(|e| ceremony_error(cancel, e))?;
        self.vrf()
            .await?
            .deliver_wrap_key_seed(
                &session.session_id,
                account_id,
                &outcome.prf.first,
                None,
                outcome.prf.second.as_ref(),
            )
            .await?;

        progress.step("deriving-keypair", Value::Null);
        let derived: DerivedKeypair = decode(
            "DERIVE_KEYPAIR_AND_ENCRYPT",
            self.pool
                .send_message(
                    &session.session_id,
                    WorkerRequest::DeriveKeypairAndEncrypt(DeriveKeypairRequest {
                        session_id: session.session_id.clone(),
                        account_id: account_id.to_string(),
                    }),
                    progress.sender(),
                )
                .await?,
        )?;
        drop(session);
        ensure_active(cancel)?;

        let transaction_hash = match &self.relay {
            Some(relay) => {
                progress.step("creating-account", Value::Null);
                relay
                    .create_account(&CreateAccountRequest {
                        account_id: account_id.to_string(),
                        public_key: derived.public_key.clone(),
                        initial_balance: self.config.initial_account_balance.clone(),
                    })
                    .await?
                    .transaction_hash
            }
            None => {
                tracing::debug!(account_id, "No relay configured; skipping account creation");
                None
            }
        };

        self.store
            .put(AccountRecord {
                account_id: account_id.to_string(),
                credential_id: outcome.credential.id.clone(),
                public_key: derived.public_key.clone(),
                encrypted: derived.encrypted,
                rp_id: self.rp_id(),
                registered_at: Utc::now(),
                last_login_at: Some(Utc::now()),
            })
            .await;
        self.store.set_current_user(Some(account_id.to_string())).await;
        tracing::info!(account_id, "Account registered");

        Ok(RegisterResult {
            near_account_id: account_id.to_string(),
            public_key: derived.public_key,
            credential: outcome.credential.to_transport(),
            transaction_hash,
        })
    }

    /// Unlock the account's key with a passkey assertion and prove it by
    /// signing a login message.
    pub async fn login(
        &self,
        account_id: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<LoginState> {
        let mut record = self.require_account(account_id).await?;
        let session = self.open_session().await?;
        let block = self.chain.latest_block().await?;
        ensure_active(cancel)?;

        progress.step("webauthn", Value::Null);
        self.assert_credential(&record, &session, &block, cancel).await?;

        progress.step("unlocking", Value::Null);
        let signed: SignedMessage = decode(
            "SIGN_NEP413_MESSAGE",
            self.pool
                .send_message(
                    &session.session_id,
                    WorkerRequest::SignNep413Message(SignNep413Request {
                        session_id: session.session_id.clone(),
                        account_id: account_id.to_string(),
                        encrypted: record.encrypted.clone(),
                        message: format!("login:{}", block.hash),
                        recipient: self.rp_id(),
                        nonce: crypto::b64u_encode(&crypto::random_bytes::<32>()),
                        state: None,
                    }),
                    progress.sender(),
                )
                .await?,
        )?;
        drop(session);

        if signed.public_key != record.public_key {
            return Err(WorkerError::OperationFailed {
                operation: "SIGN_NEP413_MESSAGE".to_string(),
                reason: "unlocked key does not match the registered public key".to_string(),
            }
            .into());
        }

        record.last_login_at = Some(Utc::now());
        let public_key = record.public_key.clone();
        self.store.put(record).await;
        self.store.set_current_user(Some(account_id.to_string())).await;
        tracing::info!(account_id, "Logged in");

        Ok(LoginState {
            is_logged_in: true,
            near_account_id: Some(account_id.to_string()),
            public_key: Some(public_key),
        })
    }

    pub async fn logout(&self) -> LoginState {
        if let Some(account_id) = self.store.current_user().await {
            tracing::info!(account_id = %account_id, "Logged out");
        }
        self.store.set_current_user(None).await;
        LoginState::default()
    }

    pub async fn login_state(&self) -> LoginState {
        let Some(account_id) = self.store.current_user().await else {
            return LoginState::default();
        };
        match self.store.get(&account_id).await {
            Some(record) => LoginState {
                is_logged_in: true,
                near_account_id: Some(account_id),
                public_key: Some(record.public_key),
            },
            None => LoginState::default(),
        }
    }

    /// Reserve, authenticate, confirm, sign, broadcast, release.
    pub async fn sign_and_send(
        &self,
        account_id: &str,
        transactions: Vec<TransactionInput>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<SignAndSendResult> {
        if transactions.is_empty() {
            return Err(Error::InvalidRequest("no transactions to sign".to_string()));
        }
        let record = self.require_account(account_id).await?;

        progress.step("preparing", json!({ "count": transactions.len() }));
        let session = self.open_session().await?;

        let confirm_config = self.preferences.get().apply_to(self.config.confirmation);
        let handle = self.confirm.mount_confirm_ui(ConfirmRequest {
            title: "Confirm transaction".to_string(),
            account_id: account_id.to_string(),
            transactions: transactions.clone(),
            config: confirm_config,
        })?;

        let access = self
            .chain
            .view_access_key(account_id, &record.public_key)
            .await?;
        ensure_active(cancel)?;

        progress.step("webauthn", Value::Null);
        self.assert_credential(&record, &session, &access.block, cancel)
            .await?;

        progress.step("awaiting-confirmation", Value::Null);
        let decision = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            decision = self.confirm.await_confirm_ui_decision(&handle, &transactions) => {
                decision.map_err(|e| match e {
                    ConfirmError::Superseded if cancel.is_cancelled() => Error::Cancelled,
                    other => other.into(),
                })
            }
        };
        if let Err(e) = decision {
            handle.close(false);
            return Err(e);
        }
        let intent_digest = handle
            .intent_digest()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidRequest("no intent digest for transactions".to_string()))?;
        handle.close(true);

        progress.step("signing", Value::Null);
        let signed: SignedTransactions = decode(
            "SIGN_TRANSACTIONS_WITH_ACTIONS",
            self.pool
                .send_message(
                    &session.session_id,
                    WorkerRequest::SignTransactionsWithActions(SignTransactionsRequest {
                        session_id: session.session_id.clone(),
                        signer_id: account_id.to_string(),
                        encrypted: record.encrypted.clone(),
                        transactions,
                        nonce: access.nonce + 1,
                        block_hash: access.block.hash.clone(),
                        intent_digest,
                    }),
                    progress.sender(),
                )
                .await?,
        )?;
        drop(session);

        progress.step("broadcasting", Value::Null);
        let mut outcomes = Vec::with_capacity(signed.transactions.len());
        for transaction in &signed.transactions {
            outcomes.push(self.chain.send_transaction(transaction).await?);
        }

        Ok(SignAndSendResult {
            transactions: signed.transactions,
            outcomes,
        })
    }

    /// Decrypt the account key after an explicit confirmation.
    pub async fn export_keypair(
        &self,
        account_id: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<DecryptedKeypair> {
        let record = self.require_account(account_id).await?;
        let session = self.open_session().await?;

        let mut confirm_config = self.preferences.get().apply_to(self.config.confirmation);
        if confirm_config.ui_mode == ConfirmUiMode::Skip {
            confirm_config.ui_mode = ConfirmUiMode::Modal;
        }
        let handle = self.confirm.mount_confirm_ui(ConfirmRequest {
            title: "Export private key".to_string(),
            account_id: account_id.to_string(),
            transactions: Vec::new(),
            config: confirm_config,
        })?;

        let block = self.chain.latest_block().await?;
        progress.step("webauthn", Value::Null);
        self.assert_credential(&record, &session, &block, cancel).await?;

        let decision = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            decision = self.confirm.await_confirm_ui_decision(&handle, &[]) => decision.map_err(Error::from),
        };
        handle.close(decision.is_ok());
        decision?;

        let keypair: DecryptedKeypair = decode(
            "DECRYPT_PRIVATE_KEY_WITH_PRF",
            self.pool
                .send_message(
                    &session.session_id,
                    WorkerRequest::DecryptPrivateKeyWithPrf(DecryptKeyRequest {
                        session_id: session.session_id.clone(),
                        account_id: account_id.to_string(),
                        encrypted: record.encrypted.clone(),
                    }),
                    progress.sender(),
                )
                .await?,
        )?;
        tracing::info!(account_id, "Private key exported");
        Ok(keypair)
    }

    pub async fn view_access_keys(&self, account_id: &str) -> Result<Vec<AccessKeyInfo>> {
        Ok(self.chain.view_access_key_list(account_id).await?)
    }

    /// Rebuild the local account record from a discoverable passkey.
    pub async fn recover_account(
        &self,
        account_id: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<LoginState> {
        let session = self.open_session().await?;
        let block = self.chain.latest_block().await?;
        let user_id = account_id.unwrap_or_default();
        let challenge = self.challenge(user_id, &session.session_id, &block).await?;
        ensure_active(cancel)?;

        progress.step("webauthn", Value::Null);
        let outcome = self
            .webauthn
            .get_credential(user_id, Self::challenge_bytes(&challenge)?, Vec::new(), cancel)
            .await
            .map_err(|e| ceremony_error(cancel, e))?;
        let account_id = outcome
            .credential
            .user_handle
            .clone()
            .or_else(|| account_id.map(str::to_string))
            .ok_or_else(|| Error::InvalidRequest("passkey carries no account".to_string()))?;

        if let Some(record) = self.store.find_by_credential(&outcome.credential.id).await {
            drop(session);
            self.store
                .set_current_user(Some(record.account_id.clone()))
                .await;
            return Ok(LoginState {
                is_logged_in: true,
                near_account_id: Some(record.account_id),
                public_key: Some(record.public_key),
            });
        }

        self.vrf()
            .await?
            .deliver_wrap_key_seed(
                &session.session_id,
                &account_id,
                &outcome.prf.first,
                None,
                outcome.prf.second.as_ref(),
            )
            .await?;
        progress.step("deriving-keypair", Value::Null);
        let derived: DerivedKeypair = decode(
            "DERIVE_KEYPAIR_AND_ENCRYPT",
            self.pool
                .send_message(
                    &session.session_id,
                    WorkerRequest::DeriveKeypairAndEncrypt(DeriveKeypairRequest {
                        session_id: session.session_id.clone(),
                        account_id: account_id.clone(),
                    }),
                    progress.sender(),
                )
                .await?,
        )?;
        drop(session);

        progress.step("verifying-on-chain", Value::Null);
        self.chain
            .view_access_key(&account_id, &derived.public_key)
            .await?;

        self.store
            .put(AccountRecord {
                account_id: account_id.clone(),
                credential_id: outcome.credential.id.clone(),
                public_key: derived.public_key.clone(),
                encrypted: derived.encrypted,
                rp_id: self.rp_id(),
                registered_at: Utc::now(),
                last_login_at: Some(Utc::now()),
            })
            .await;
        self.store.set_current_user(Some(account_id.clone())).await;
        tracing::info!(account_id = %account_id, "Account recovered");

        Ok(LoginState {
            is_logged_in: true,
            near_account_id: Some(account_id),
            public_key: Some(derived.public_key),
        })
    }

    /// Link this device to an existing account.
    ///
    /// Publishes a temporary key, polls until another device adds it to the
    /// account, then swaps it for a passkey-derived key.
    pub async fn link_device(
        &self,
        account_id: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<LinkDeviceResult> {
        if self.store.get(account_id).await.is_some() {
            return Err(Error::InvalidRequest(format!(
                "{account_id} is already available on this device"
            )));
        }
        let pairing = cancel.child_token();
        if let Some(previous) = self.pairing.lock().replace(pairing.clone()) {
            previous.cancel();
        }

        let temp_key = SigningKey::from_bytes(&crypto::random_bytes::<32>());
        let temp_public_key = crypto::public_key_string(&temp_key.verifying_key());
        progress.step(
            "awaiting-key",
            json!({ "nearAccountId": account_id, "publicKey": temp_public_key }),
        );

        let access = self
            .poll_for_key(account_id, &temp_public_key, &pairing)
            .await;
        self.pairing.lock().take();
        let access = access?;

        let session = self.open_session().await?;
        let challenge = self.challenge(account_id, &session.session_id, &access.block).await?;
        progress.step("webauthn", Value::Null);
        let outcome = self
            .webauthn
            .create_credential(account_id, Self::challenge_bytes(&challenge)?, cancel)
            .await
            .map_err(|e| ceremony_error(cancel, e))?;
        self.vrf()
            .await?
            .deliver_wrap_key_seed(
                &session.session_id,
                account_id,
                &outcome.prf.first,
                None,
                outcome.prf.second.as_ref(),
            )
            .await?;
        let derived: DerivedKeypair = decode(
            "DERIVE_KEYPAIR_AND_ENCRYPT",
            self.pool
                .send_message(
                    &session.session_id,
                    WorkerRequest::DeriveKeypairAndEncrypt(DeriveKeypairRequest {
                        session_id: session.session_id.clone(),
                        account_id: account_id.to_string(),
                    }),
                    progress.sender(),
                )
                .await?,
        )?;
        drop(session);
        ensure_active(cancel)?;

        progress.step("swapping-keys", Value::Null);
        let signed: SignedTransactions = decode(
            "SIGN_TRANSACTION_WITH_KEYPAIR",
            self.pool
                .execute_stateless(
                    WorkerRequest::SignTransactionWithKeyPair(SignWithKeyPairRequest {
                        private_key: crypto::private_key_string(&temp_key),
                        signer_id: account_id.to_string(),
                        transactions: vec![TransactionInput {
                            receiver_id: account_id.to_string(),
                            actions: vec![
                                ActionArgs::AddKey {
                                    public_key: derived.public_key.clone(),
                                    access_key: AccessKeyArgs {
                                        nonce: 0,
                                        permission: AccessKeyPermission::FullAccess,
                                    },
                                },
                                ActionArgs::DeleteKey {
                                    public_key: temp_public_key.clone(),
                                },
                            ],
                        }],
                        nonce: access.nonce + 1,
                        block_hash: access.block.hash.clone(),
                    }),
                    progress.sender(),
                )
                .await?,
        )?;
        let transaction = signed.transactions.first().ok_or_else(|| WorkerError::OperationFailed {
            operation: "SIGN_TRANSACTION_WITH_KEYPAIR".to_string(),
            reason: "no transaction returned".to_string(),
        })?;
        let outcome_tx = self.chain.send_transaction(transaction).await?;

        self.store
            .put(AccountRecord {
                account_id: account_id.to_string(),
                credential_id: outcome.credential.id.clone(),
                public_key: derived.public_key.clone(),
                encrypted: derived.encrypted,
                rp_id: self.rp_id(),
                registered_at: Utc::now(),
                last_login_at: Some(Utc::now()),
            })
            .await;
        self.store.set_current_user(Some(account_id.to_string())).await;
        tracing::info!(account_id, "Device linked");

        Ok(LinkDeviceResult {
            near_account_id: account_id.to_string(),
            public_key: derived.public_key,
            transaction_hash: outcome_tx.transaction_hash,
        })
    }

    async fn poll_for_key(
        &self,
        account_id: &str,
        public_key: &str,
        pairing: &CancellationToken,
    ) -> Result<chain::AccessKeyView> {
        let LinkPolling { interval, timeout } = self.link_polling;
        let poll = async {
            loop {
                match self.chain.view_access_key(account_id, public_key).await {
                    Ok(view) => return view,
                    Err(e) => tracing::trace!(account_id, "Key not yet added: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        };
        tokio::select! {
            _ = pairing.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, poll) => result.map_err(|_| {
                Error::InvalidRequest(format!("device linking timed out after {timeout:?}"))
            }),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let registry = self.confirm.registry();
        let mut modes: Vec<&'static str> = [ConfirmUiMode::Modal, ConfirmUiMode::Drawer]
            .into_iter()
            .filter(|m| registry.is_registered(*m))
            .map(ConfirmUiMode::as_str)
            .collect();
        modes.push(ConfirmUiMode::Skip.as_str());
        Capabilities {
            protocol_version: PROTOCOL_VERSION,
            prf: true,
            secure_context: self.webauthn.is_secure_context(),
            rp_id: self.rp_id(),
            confirm_ui_modes: modes,
            relay: self.relay.is_some(),
            worker_pool_capacity: self.config.pool.capacity,
        }
    }
}

impl Drop for WalletClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
