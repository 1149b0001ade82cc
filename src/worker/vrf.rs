//! VRF challenge worker.
//!
//! Runs as its own task behind a port, like the signer workers. It owns the
//! VRF keypair and the VRF-side end of each session's seed port. Given a
//! session's PRF output it derives the wrap-key seed, sends it to the signer
//! worker exactly once and closes the port. The host only ever sees the
//! salt that was used.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use secrecy::{ExposeSecret, SecretSlice};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::channel::{MessageChannel, Port};
use crate::error::{Error, Result, SessionError, WorkerError};
use crate::protocol::worker::{
    DeliverSeedRequest, FailSeedRequest, SeedDelivery, SeedReceipt, SeedSessionRequest,
    VrfChallenge, VrfInputData, VrfRequest, WORKER_READY, WorkerResponse,
};
use crate::worker::crypto::{self, CryptoError, WRAP_KEY_SALT_LEN};
use crate::worker::queue::encode_request;
use crate::worker::{SpawnedWorker, WorkerHandle, WorkerSpawner};

/// VRF worker ids sit in their own range so logs never confuse them with signers.
static NEXT_VRF_WORKER_ID: AtomicU64 = AtomicU64::new(1 << 32);

impl VrfChallenge {
    /// Bytes used as the WebAuthn challenge.
    pub fn challenge_bytes(&self) -> std::result::Result<Vec<u8>, CryptoError> {
        crypto::b64u_decode("vrfOutput", &self.vrf_output)
    }

    /// Check proof, output and input binding.
    pub fn verify(&self) -> bool {
        let Ok(expected_input) = hash_input(&self.input) else {
            return false;
        };
        if crypto::b64u_encode(&expected_input) != self.vrf_input {
            return false;
        }
        let Ok(public_key) = crypto::parse_public_key(&self.vrf_public_key) else {
            return false;
        };
        let Ok(proof) = crypto::b64u_decode("vrfProof", &self.vrf_proof) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&proof) else {
            return false;
        };
        if public_key.verify(&expected_input, &signature).is_err() {
            return false;
        }
        crypto::b64u_encode(&Sha256::digest(&proof)) == self.vrf_output
    }
}

fn hash_input(input: &VrfInputData) -> std::result::Result<[u8; 32], CryptoError> {
    let bytes = serde_json::to_vec(input)
        .map_err(|e| CryptoError::InvalidKey(format!("unserializable VRF input: {e}")))?;
    Ok(Sha256::digest(&bytes).into())
}

/// Spawns the VRF worker as a tokio task.
#[derive(Debug, Default)]
pub struct InProcessVrfSpawner;

impl WorkerSpawner for InProcessVrfSpawner {
    fn spawn(&self) -> std::result::Result<SpawnedWorker, WorkerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| WorkerError::SpawnFailed {
            reason: e.to_string(),
        })?;
        let id = NEXT_VRF_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let (host, worker) = MessageChannel::new().into_ports();
        let task = runtime.spawn(run_vrf_worker(id, worker));
        Ok(SpawnedWorker {
            id,
            port: host,
            task: task.abort_handle(),
        })
    }
}

/// State that never leaves the worker task.
struct VrfState {
    keypair: SigningKey,
    seed_ports: HashMap<String, Port>,
}

impl VrfState {
    fn new() -> Self {
        Self {
            keypair: SigningKey::from_bytes(&crypto::random_bytes::<32>()),
            seed_ports: HashMap::new(),
        }
    }

    fn generate_challenge(&self, input: VrfInputData) -> std::result::Result<VrfChallenge, CryptoError> {
        let vrf_input = hash_input(&input)?;
        let proof = self.keypair.sign(&vrf_input).to_bytes();
        let output = Sha256::digest(proof);
        Ok(VrfChallenge {
            input,
            vrf_input: crypto::b64u_encode(&vrf_input),
            vrf_output: crypto::b64u_encode(&output),
            vrf_proof: crypto::b64u_encode(&proof),
            vrf_public_key: crypto::public_key_string(&self.keypair.verifying_key()),
        })
    }

    /// A previous port for the same session is closed.
    fn attach(&mut self, session_id: String, port: Port) {
        if let Some(old) = self.seed_ports.insert(session_id, port) {
            old.close();
        }
    }

    fn deliver(&mut self, req: DeliverSeedRequest) -> std::result::Result<SeedReceipt, String> {
        let port = self
            .seed_ports
            .remove(&req.session_id)
            .ok_or_else(|| "no seed port attached".to_string())?;

        let delivered = derive_delivery(&req).and_then(|delivery| {
            let salt = delivery.wrap_key_salt.clone().unwrap_or_default();
            let data = serde_json::to_value(&delivery).map_err(|e| e.to_string())?;
            port.post_json(data).map_err(|e| e.to_string())?;
            Ok(salt)
        });
        if let Err(e) = &delivered {
            send_seed_error(&port, e);
        }
        port.close();

        Ok(SeedReceipt {
            session_id: req.session_id,
            wrap_key_salt: delivered?,
        })
    }

    fn fail(&mut self, session_id: &str, error: &str) {
        if let Some(port) = self.seed_ports.remove(session_id) {
            send_seed_error(&port, error);
            port.close();
        }
    }

    fn close_all(&mut self) {
        for (_, port) in self.seed_ports.drain() {
            port.close();
        }
    }
}

fn derive_delivery(req: &DeliverSeedRequest) -> std::result::Result<SeedDelivery, String> {
    let prf_first = crypto::b64u_decode("prfFirst", &req.prf_first).map_err(|e| e.to_string())?;
    let seed = crypto::derive_wrap_key_seed(&prf_first, &req.account_id).map_err(|e| e.to_string())?;
    let salt = match &req.wrap_key_salt {
        Some(salt) => crypto::b64u_decode("wrapKeySalt", salt).map_err(|e| e.to_string())?,
        None => crypto::random_bytes::<WRAP_KEY_SALT_LEN>().to_vec(),
    };
    Ok(SeedDelivery {
        ok: true,
        wrap_key_seed: Some(crypto::b64u_encode(&seed)),
        wrap_key_salt: Some(crypto::b64u_encode(&salt)),
        prf_second: req.prf_second.clone(),
        error: None,
    })
}

fn send_seed_error(port: &Port, error: &str) {
    let _ = port.post_json(json!({ "ok": false, "error": error }));
}

fn post_response(port: &Port, response: WorkerResponse) -> std::result::Result<(), ()> {
    let data = serde_json::to_value(&response).map_err(|_| ())?;
    port.post_json(data).map_err(|_| ())
}

fn respond<T: serde::Serialize>(outcome: std::result::Result<T, String>) -> WorkerResponse {
    match outcome.and_then(|value| serde_json::to_value(value).map_err(|e| e.to_string())) {
        Ok(payload) => WorkerResponse::Result { payload },
        Err(error) => WorkerResponse::Failure { error },
    }
}

/// Worker entry point. Returns when the host drops its end.
pub async fn run_vrf_worker(worker_id: u64, port: Port) {
    let mut state = VrfState::new();
    if port
        .post_json(json!({ "type": WORKER_READY, "ready": true }))
        .is_err()
    {
        return;
    }

    while let Some(mut message) = port.recv().await {
        let transferred = message.ports.pop();
        let request: VrfRequest = match serde_json::from_value(message.data) {
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
        tracing::debug!(worker_id, operation = request.name(), "VRF worker handling request");

        let response = match request {
            VrfRequest::GenerateVrfChallenge(input) => {
                respond(state.generate_challenge(input).map_err(|e| e.to_string()))
            }
            VrfRequest::AttachVrfSeedPort(SeedSessionRequest { session_id }) => match transferred {
                Some(seed_port) => {
                    state.attach(session_id.clone(), seed_port);
                    WorkerResponse::Result {
                        payload: json!({ "sessionId": session_id }),
                    }
                }
                None => WorkerResponse::Failure {
                    error: "no port transferred".to_string(),
                },
            },
            VrfRequest::DeliverWrapKeySeed(req) => {
                let session_id = req.session_id.clone();
                let outcome = state.deliver(req);
                match &outcome {
                    Ok(_) => tracing::debug!(worker_id, session_id = %session_id, "Wrap key seed delivered"),
                    Err(e) => tracing::debug!(worker_id, session_id = %session_id, error = %e, "Wrap key seed not delivered"),
                }
                respond(outcome)
            }
            VrfRequest::FailWrapKeySeedSession(FailSeedRequest { session_id, error }) => {
                state.fail(&session_id, &error);
                continue;
            }
        };
        if post_response(&port, response).is_err() {
            break;
        }
    }

    state.close_all();
    tracing::debug!(worker_id, "VRF worker exiting");
}

/// The orchestrator's view of the VRF worker: a port and nothing else.
#[derive(Debug)]
pub struct VrfWorkerHandle {
    worker: WorkerHandle,
}

impl VrfWorkerHandle {
    /// Spawn the worker and wait for `WORKER_READY`.
    pub async fn start(spawner: &dyn WorkerSpawner, health_timeout: Duration) -> Result<Self> {
        let worker = WorkerHandle::start(spawner.spawn()?, health_timeout).await?;
        Ok(Self { worker })
    }

    pub fn id(&self) -> u64 {
        self.worker.id()
    }

    async fn call(&self, request: VrfRequest, ports: Vec<Port>) -> std::result::Result<Value, WorkerError> {
        let operation = request.name();
        let mut message = encode_request(operation, &request)?;
        message.ports = ports;
        self.worker.queue().submit(operation, message, None).await
    }

    pub async fn generate_challenge(&self, input: VrfInputData) -> Result<VrfChallenge> {
        let payload = self
            .call(VrfRequest::GenerateVrfChallenge(input), Vec::new())
            .await?;
        serde_json::from_value(payload).map_err(|e| {
            WorkerError::MalformedResponse {
                worker_id: self.id(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Hand the VRF end of a session's seed channel to the worker.
    pub async fn attach_seed_port(&self, session_id: &str, port: Port) -> Result<()> {
        let request = VrfRequest::AttachVrfSeedPort(SeedSessionRequest {
            session_id: session_id.to_string(),
        });
        self.call(request, vec![port]).await.map_err(|e| {
            Error::from(SessionError::HandshakeFailed {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })
        })?;
        Ok(())
    }

    /// Have the worker derive the wrap-key seed and send it to the signer.
    ///
    /// Uses `wrap_key_salt` when the account already has one (login,
    /// signing); otherwise the worker draws a fresh salt (registration).
    /// Returns the salt used.
    pub async fn deliver_wrap_key_seed(
        &self,
        session_id: &str,
        account_id: &str,
        prf_first: &SecretSlice<u8>,
        wrap_key_salt: Option<&str>,
        prf_second: Option<&SecretSlice<u8>>,
    ) -> Result<String> {
        let request = VrfRequest::DeliverWrapKeySeed(DeliverSeedRequest {
            session_id: session_id.to_string(),
            account_id: account_id.to_string(),
            prf_first: crypto::b64u_encode(prf_first.expose_secret()),
            wrap_key_salt: wrap_key_salt.map(str::to_string),
            prf_second: prf_second.map(|p| crypto::b64u_encode(p.expose_secret())),
        });
        let payload = self.call(request, Vec::new()).await.map_err(|e| match e {
            WorkerError::OperationFailed { reason, .. } => Error::from(SessionError::SeedUnavailable {
                session_id: session_id.to_string(),
                reason,
            }),
            other => other.into(),
        })?;
        let receipt: SeedReceipt =
            serde_json::from_value(payload).map_err(|e| WorkerError::MalformedResponse {
                worker_id: self.id(),
                reason: e.to_string(),
            })?;
        Ok(receipt.wrap_key_salt)
    }

    /// Tell the signer worker no seed is coming. Does not wait.
    pub fn fail_session(&self, session_id: &str, error: &str) {
        let request = VrfRequest::FailWrapKeySeedSession(FailSeedRequest {
            session_id: session_id.to_string(),
            error: error.to_string(),
        });
        let sent = encode_request(request.name(), &request)
            .and_then(|message| self.worker.queue().notify(message));
        if let Err(e) = sent {
            tracing::debug!(session_id, "Seed failure notice not sent: {}", e);
        }
    }

    /// Kill the worker. Its seed ports close with it.
    pub fn terminate(&self) {
        self.worker.terminate();
    }

    pub fn is_terminated(&self) -> bool {
        self.worker.is_terminated()
    }
}

impl Drop for VrfWorkerHandle {
    fn drop(&mut self) {
        self.worker.terminate();
    }
}
