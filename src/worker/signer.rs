//! Signer worker runtime.
//!
//! Runs as its own task and talks to the host only through its port. After
//! `ATTACH_WRAP_KEY_SEED_PORT` it listens on the transferred port for exactly
//! one seed delivery from the VRF worker; the seed never crosses the host's
//! port. Session-bound operations wait (bounded) for that seed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretSlice};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::channel::{MessageChannel, Port};
use crate::error::WorkerError;
use crate::protocol::worker::{
    ATTACH_WRAP_KEY_SEED_PORT, ATTACH_WRAP_KEY_SEED_PORT_ERROR, ATTACH_WRAP_KEY_SEED_PORT_OK,
    DecryptKeyRequest, DecryptedKeypair, DeriveKeypairRequest, DerivedKeypair, EncryptedKeyData,
    SeedDelivery, SignNep413Request, SignTransactionsRequest, SignWithKeyPairRequest,
    SignedMessage, SignedTransactions, WORKER_READY, WRAP_KEY_SEED_READY, WorkerRequest,
    WorkerResponse,
};
use crate::worker::crypto::{self, CryptoError};
use crate::worker::{SpawnedWorker, WorkerSpawner};

/// How long a session-bound operation waits for the wrap-key seed.
pub const SEED_WAIT: Duration = Duration::from_secs(2);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Spawns signer workers as tokio tasks.
#[derive(Debug, Default)]
pub struct InProcessSignerSpawner;

impl WorkerSpawner for InProcessSignerSpawner {
    fn spawn(&self) -> Result<SpawnedWorker, WorkerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| WorkerError::SpawnFailed {
            reason: e.to_string(),
        })?;
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let (host, worker) = MessageChannel::new().into_ports();
        let task = runtime.spawn(run_signer_worker(id, worker));
        Ok(SpawnedWorker {
            id,
            port: host,
            task: task.abort_handle(),
        })
    }
}

/// Seed material delivered over the private port.
struct SeedMaterial {
    session_id: String,
    wrap_key_seed: SecretSlice<u8>,
    wrap_key_salt: Vec<u8>,
    prf_second: Option<SecretSlice<u8>>,
}

type SeedState = Option<Result<Arc<SeedMaterial>, String>>;

#[derive(Debug, thiserror::Error)]
enum OpError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("{0}")]
    Rejected(String),
}

/// Worker entry point. Returns when the host drops its end.
pub async fn run_signer_worker(worker_id: u64, port: Port) {
    let port = Arc::new(port);
    let (seed_tx, seed_rx) = watch::channel::<SeedState>(None);
    let mut seed_listener = JoinSet::new();
    let mut attached_session: Option<String> = None;

    if port
        .post_json(json!({ "type": WORKER_READY, "ready": true }))
        .is_err()
    {
        return;
    }

    while let Some(mut message) = port.recv().await {
        if message.kind() == Some(ATTACH_WRAP_KEY_SEED_PORT) {
            let session_id = message
                .data
                .get("sessionId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let reply = match (attached_session.as_ref(), message.ports.pop()) {
                (Some(existing), _) => json!({
                    "type": ATTACH_WRAP_KEY_SEED_PORT_ERROR,
                    "sessionId": session_id,
                    "error": format!("worker already bound to session {existing}"),
                }),
                (None, None) => json!({
                    "type": ATTACH_WRAP_KEY_SEED_PORT_ERROR,
                    "sessionId": session_id,
                    "error": "no port transferred",
                }),
                (None, Some(seed_port)) => {
                    attached_session = Some(session_id.clone());
                    seed_listener.spawn(listen_for_seed(
                        session_id.clone(),
                        seed_port,
                        Arc::clone(&port),
                        seed_tx.clone(),
                    ));
                    json!({ "type": ATTACH_WRAP_KEY_SEED_PORT_OK, "sessionId": session_id })
                }
            };
            if port.post_json(reply).is_err() {
                break;
            }
            continue;
        }

        let request: WorkerRequest = match serde_json::from_value(message.data) {
            Ok(request) => request,
            Err(e) => {
                let _ = post_response(
                    &port,
                    WorkerResponse::Failure {
                        error: format!("unrecognised request: {e}"),
                    },
                );
                continue;
            }
        };

        let response = handle_request(worker_id, &port, request, seed_rx.clone()).await;
        if post_response(&port, response).is_err() {
            break;
        }
    }

    tracing::debug!(worker_id, "Signer worker exiting");
}

fn post_response(port: &Port, response: WorkerResponse) -> Result<(), ()> {
    let data = serde_json::to_value(&response).map_err(|_| ())?;
    port.post_json(data).map_err(|_| ())
}

async fn listen_for_seed(
    session_id: String,
    seed_port: Port,
    host_port: Arc<Port>,
    seed_tx: watch::Sender<SeedState>,
) {
    let outcome = match seed_port.recv().await {
        Some(message) => parse_seed(&session_id, message.data),
        None => Err("seed port closed before delivery".to_string()),
    };
    seed_port.close();

    let signal = match &outcome {
        Ok(_) => json!({ "type": WRAP_KEY_SEED_READY, "sessionId": session_id, "ok": true }),
        Err(error) => json!({
            "type": WRAP_KEY_SEED_READY,
            "sessionId": session_id,
            "ok": false,
            "error": error,
        }),
    };
    seed_tx.send_replace(Some(outcome.map(Arc::new)));
    let _ = host_port.post_json(signal);
}

fn parse_seed(session_id: &str, data: Value) -> Result<SeedMaterial, String> {
    let delivery: SeedDelivery =
        serde_json::from_value(data).map_err(|e| format!("malformed seed delivery: {e}"))?;
    if !delivery.ok {
        return Err(delivery
            .error
            .unwrap_or_else(|| "VRF worker reported failure".to_string()));
    }
    let seed = delivery
        .wrap_key_seed
        .ok_or_else(|| "seed delivery missing wrap_key_seed".to_string())?;
    let salt = delivery
        .wrap_key_salt
        .ok_or_else(|| "seed delivery missing wrapKeySalt".to_string())?;

    let seed = crypto::b64u_decode("wrap_key_seed", &seed).map_err(|e| e.to_string())?;
    let salt = crypto::b64u_decode("wrapKeySalt", &salt).map_err(|e| e.to_string())?;
    let prf_second = delivery
        .prf_second
        .map(|p| crypto::b64u_decode("prfSecond", &p))
        .transpose()
        .map_err(|e| e.to_string())?;

    Ok(SeedMaterial {
        session_id: session_id.to_string(),
        wrap_key_seed: SecretSlice::from(seed),
        wrap_key_salt: salt,
        prf_second: prf_second.map(SecretSlice::from),
    })
}

async fn wait_for_seed(
    session_id: &str,
    mut seed_rx: watch::Receiver<SeedState>,
) -> Result<Arc<SeedMaterial>, OpError> {
    let wait = seed_rx.wait_for(Option::is_some);
    let state = match tokio::time::timeout(SEED_WAIT, wait).await {
        Ok(Ok(state)) => state.clone(),
        Ok(Err(_)) => return Err(OpError::Rejected("seed channel closed".to_string())),
        Err(_) => {
            return Err(OpError::Rejected(format!(
                "wrap key seed not received within {SEED_WAIT:?}"
            )));
        }
    };
    match state {
        Some(Ok(material)) if material.session_id == session_id => Ok(material),
        Some(Ok(material)) => Err(OpError::Rejected(format!(
            "worker holds seed for session {}, not {session_id}",
            material.session_id
        ))),
        Some(Err(reason)) => Err(OpError::Rejected(reason)),
        None => Err(OpError::Rejected("wrap key seed unavailable".to_string())),
    }
}

fn progress(port: &Port, step: &str) {
    let _ = post_response(
        port,
        WorkerResponse::Progress {
            payload: json!({ "step": step }),
        },
    );
}

fn kek_for(material: &SeedMaterial, salt_b64u: &str) -> Result<[u8; 32], OpError> {
    let salt = crypto::b64u_decode("wrapKeySalt", salt_b64u)?;
    if salt != material.wrap_key_salt {
        return Err(OpError::Rejected(
            "encrypted key was wrapped under a different salt".to_string(),
        ));
    }
    Ok(crypto::derive_kek(
        material.wrap_key_seed.expose_secret(),
        &material.wrap_key_salt,
    )?)
}

fn unwrap_key(
    material: &SeedMaterial,
    encrypted: &EncryptedKeyData,
) -> Result<ed25519_dalek::SigningKey, OpError> {
    let kek = kek_for(material, &encrypted.wrap_key_salt)?;
    Ok(crypto::decrypt_private_key(
        &kek,
        &encrypted.encrypted_key,
        &encrypted.iv,
    )?)
}

async fn handle_request(
    worker_id: u64,
    port: &Port,
    request: WorkerRequest,
    seed_rx: watch::Receiver<SeedState>,
) -> WorkerResponse {
    let operation = request.name();
    tracing::debug!(worker_id, operation, "Signer worker handling request");

    let result = match request {
        WorkerRequest::DeriveKeypairAndEncrypt(req) => derive_keypair(port, req, seed_rx).await,
        WorkerRequest::DecryptPrivateKeyWithPrf(req) => decrypt_keypair(req, seed_rx).await,
        WorkerRequest::SignTransactionsWithActions(req) => {
            sign_transactions(port, req, seed_rx).await
        }
        WorkerRequest::SignNep413Message(req) => sign_message(req, seed_rx).await,
        WorkerRequest::SignTransactionWithKeyPair(req) => sign_with_keypair(req),
    };

    match result {
        Ok(payload) => WorkerResponse::Result { payload },
        Err(e) => {
            tracing::debug!(worker_id, operation, error = %e, "Signer worker request failed");
            WorkerResponse::Failure {
                error: e.to_string(),
            }
        }
    }
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<Value, OpError> {
    serde_json::to_value(value).map_err(|e| OpError::Rejected(e.to_string()))
}

async fn derive_keypair(
    port: &Port,
    req: DeriveKeypairRequest,
    seed_rx: watch::Receiver<SeedState>,
) -> Result<Value, OpError> {
    let material = wait_for_seed(&req.session_id, seed_rx).await?;
    let prf_second = material
        .prf_second
        .as_ref()
        .ok_or_else(|| OpError::Rejected("registration requires PRF.second".to_string()))?;

    progress(port, "deriving-keypair");
    let key = crypto::derive_signing_key(prf_second.expose_secret(), &req.account_id)?;
    let kek = crypto::derive_kek(
        material.wrap_key_seed.expose_secret(),
        &material.wrap_key_salt,
    )?;
    let (encrypted_key, iv) = crypto::encrypt_private_key(&kek, &key)?;

    to_payload(&DerivedKeypair {
        public_key: crypto::public_key_string(&key.verifying_key()),
        encrypted: EncryptedKeyData {
            encrypted_key,
            iv,
            wrap_key_salt: crypto::b64u_encode(&material.wrap_key_salt),
        },
    })
}

async fn decrypt_keypair(
    req: DecryptKeyRequest,
    seed_rx: watch::Receiver<SeedState>,
) -> Result<Value, OpError> {
    let material = wait_for_seed(&req.session_id, seed_rx).await?;
    let key = unwrap_key(&material, &req.encrypted)?;
    to_payload(&DecryptedKeypair {
        account_id: req.account_id,
        public_key: crypto::public_key_string(&key.verifying_key()),
        private_key: crypto::private_key_string(&key),
    })
}

async fn sign_transactions(
    port: &Port,
    req: SignTransactionsRequest,
    seed_rx: watch::Receiver<SeedState>,
) -> Result<Value, OpError> {
    let computed = crate::confirm::digest::compute_intent_digest(&req.transactions)
        .map_err(|e| OpError::Rejected(e.to_string()))?;
    if !crate::confirm::digest::digests_match(&computed, &req.intent_digest) {
        return Err(OpError::Rejected(
            "transactions do not match the confirmed intent".to_string(),
        ));
    }

    let material = wait_for_seed(&req.session_id, seed_rx).await?;
    let key = unwrap_key(&material, &req.encrypted)?;

    progress(port, "signing");
    let transactions = req
        .transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| {
            crypto::sign_transaction(&key, &req.signer_id, req.nonce + i as u64, &req.block_hash, tx)
        })
        .collect::<Result<Vec<_>, _>>()?;

    to_payload(&SignedTransactions { transactions })
}

async fn sign_message(
    req: SignNep413Request,
    seed_rx: watch::Receiver<SeedState>,
) -> Result<Value, OpError> {
    let material = wait_for_seed(&req.session_id, seed_rx).await?;
    let key = unwrap_key(&material, &req.encrypted)?;
    let signature = crypto::sign_nep413(&key, &req.message, &req.recipient, &req.nonce)?;
    to_payload(&SignedMessage {
        account_id: req.account_id,
        public_key: crypto::public_key_string(&key.verifying_key()),
        signature,
        state: req.state,
    })
}

fn sign_with_keypair(req: SignWithKeyPairRequest) -> Result<Value, OpError> {
    let key = crypto::parse_private_key(&req.private_key)?;
    let transactions = req
        .transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| {
            crypto::sign_transaction(&key, &req.signer_id, req.nonce + i as u64, &req.block_hash, tx)
        })
        .collect::<Result<Vec<_>, _>>()?;
    to_payload(&SignedTransactions { transactions })
}
