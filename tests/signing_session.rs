//! Signing session lifecycle against real and scripted signer workers.
//!
//! Covers the reserve → seed handoff → confirm → sign path without the
//! router, then the teardown paths: handshake timeout, missing seed,
//! operation timeout, worker crash, malformed response and stateless
//! borrowing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use secrecy::SecretSlice;
use serde_json::json;

use common::{Script, ScriptedSurfaces};
use passkey_host::channel::{MessageChannel, Port};
use passkey_host::config::{ConfirmationConfig, WorkerPoolConfig};
use passkey_host::confirm::{ConfirmRequest, ConfirmState, ConfirmUiController};
use passkey_host::error::{ConfirmError, Error, SessionError, WorkerError};
use passkey_host::protocol::worker::{
    DeriveKeypairRequest, DerivedKeypair, SignTransactionsRequest, SignWithKeyPairRequest,
    SignedTransactions, WorkerRequest,
};
use passkey_host::protocol::{ActionArgs, TransactionInput};
use passkey_host::worker::crypto;
use passkey_host::worker::{
    InProcessSignerSpawner, InProcessVrfSpawner, SignerWorkerPool, SpawnedWorker,
    VrfWorkerHandle, WorkerSpawner,
};

const ACCOUNT: &str = "alice.testnet";
const BLOCK_HASH: &str = "4reLvkAWfqk5fsqio1KLudk46cqRz9erQdaHkWZKMJDZ";

fn pool_config(capacity: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        capacity,
        ..WorkerPoolConfig::default()
    }
}

fn transfer(receiver: &str, deposit: &str) -> TransactionInput {
    TransactionInput {
        receiver_id: receiver.to_string(),
        actions: vec![ActionArgs::Transfer {
            deposit: deposit.to_string(),
        }],
    }
}

fn prf(byte: u8) -> SecretSlice<u8> {
    SecretSlice::from(vec![byte; 32])
}

async fn vrf_worker() -> VrfWorkerHandle {
    VrfWorkerHandle::start(&InProcessVrfSpawner, Duration::from_secs(5))
        .await
        .unwrap()
}

fn derive_request(session_id: &str) -> WorkerRequest {
    WorkerRequest::DeriveKeypairAndEncrypt(DeriveKeypairRequest {
        session_id: session_id.to_string(),
        account_id: ACCOUNT.to_string(),
    })
}

fn stateless_request(nonce: u64) -> WorkerRequest {
    WorkerRequest::SignTransactionWithKeyPair(SignWithKeyPairRequest {
        private_key: "ed25519:unused".to_string(),
        signer_id: ACCOUNT.to_string(),
        transactions: vec![transfer("bob.testnet", "1")],
        nonce,
        block_hash: BLOCK_HASH.to_string(),
    })
}

/// Reserve `session_id`, hand the seed over and derive a key inside the worker.
async fn reserve_and_derive(
    pool: &SignerWorkerPool,
    vrf: &VrfWorkerHandle,
    session_id: &str,
) -> DerivedKeypair {
    let seed_port = pool.reserve_session(session_id).await.unwrap();
    vrf.attach_seed_port(session_id, seed_port).await.unwrap();
    vrf.deliver_wrap_key_seed(session_id, ACCOUNT, &prf(1), None, Some(&prf(2)))
        .await
        .unwrap();

    let derived = pool
        .send_message(session_id, derive_request(session_id), None)
        .await
        .unwrap();
    serde_json::from_value(derived).unwrap()
}

fn confirm_request(transactions: Vec<TransactionInput>) -> ConfirmRequest {
    ConfirmRequest {
        title: "Confirm transaction".to_string(),
        account_id: ACCOUNT.to_string(),
        transactions,
        config: ConfirmationConfig::default(),
    }
}

#[tokio::test]
async fn confirmed_transaction_is_signed_and_session_stays_open() {
    let pool = SignerWorkerPool::new(pool_config(2), Arc::new(InProcessSignerSpawner));
    let vrf = vrf_worker().await;
    let derived = reserve_and_derive(&pool, &vrf, "s1").await;
    assert!(pool.has_session("s1"));

    let surfaces = ScriptedSurfaces::new(Script::Confirm);
    let confirm = ConfirmUiController::new(surfaces.registry());
    let transactions = vec![transfer("bob.testnet", "1000")];
    let handle = confirm
        .mount_confirm_ui(confirm_request(transactions.clone()))
        .unwrap();
    let digest = handle.intent_digest().unwrap().to_string();

    confirm
        .await_confirm_ui_decision(&handle, &transactions)
        .await
        .unwrap();
    assert_eq!(handle.state(), ConfirmState::Confirmed);
    handle.close(true);

    let signed = pool
        .send_message(
            "s1",
            WorkerRequest::SignTransactionsWithActions(SignTransactionsRequest {
                session_id: "s1".to_string(),
                signer_id: ACCOUNT.to_string(),
                encrypted: derived.encrypted.clone(),
                transactions,
                nonce: 7,
                block_hash: BLOCK_HASH.to_string(),
                intent_digest: digest,
            }),
            None,
        )
        .await
        .unwrap();
    let signed: SignedTransactions = serde_json::from_value(signed).unwrap();

    assert_eq!(signed.transactions.len(), 1);
    assert_eq!(signed.transactions[0].public_key, derived.public_key);
    assert_eq!(signed.transactions[0].nonce, 7);
    assert!(crypto::verify_signed_transaction(&signed.transactions[0]));

    assert!(pool.has_session("s1"), "session must stay open until released");
    let worker_id = pool.session_worker_id("s1").unwrap();
    assert!(pool.release_session("s1"));
    assert!(!pool.has_session("s1"));
    assert!(!pool.idle_worker_ids().contains(&worker_id));
}

#[tokio::test]
async fn tampered_payload_is_cancelled_and_never_signed() {
    let pool = SignerWorkerPool::new(pool_config(1), Arc::new(InProcessSignerSpawner));
    let vrf = vrf_worker().await;
    let derived = reserve_and_derive(&pool, &vrf, "s1").await;

    let surfaces = ScriptedSurfaces::new(Script::Confirm);
    let confirm = ConfirmUiController::new(surfaces.registry());
    let displayed = vec![transfer("bob.testnet", "1")];
    let tampered = vec![transfer("mallory.testnet", "1000000")];
    let handle = confirm
        .mount_confirm_ui(confirm_request(displayed.clone()))
        .unwrap();
    let displayed_digest = handle.intent_digest().unwrap().to_string();

    let err = confirm
        .await_confirm_ui_decision(&handle, &tampered)
        .await
        .unwrap_err();
    assert!(matches!(err, ConfirmError::DigestMismatch { .. }));
    assert_eq!(handle.state(), ConfirmState::Cancelled);
    assert_eq!(
        Error::from(err).to_error_payload().code,
        "INTENT_DIGEST_MISMATCH"
    );

    // The worker refuses on its own as well.
    let err = pool
        .send_message(
            "s1",
            WorkerRequest::SignTransactionsWithActions(SignTransactionsRequest {
                session_id: "s1".to_string(),
                signer_id: ACCOUNT.to_string(),
                encrypted: derived.encrypted,
                transactions: tampered,
                nonce: 1,
                block_hash: BLOCK_HASH.to_string(),
                intent_digest: displayed_digest,
            }),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Worker(WorkerError::OperationFailed { .. })));
}

/// Workers that report ready but never acknowledge a seed port.
#[derive(Default)]
struct SilentSpawner {
    spawned: Mutex<Vec<u64>>,
}

impl WorkerSpawner for SilentSpawner {
    fn spawn(&self) -> Result<SpawnedWorker, WorkerError> {
        let id = {
            let mut spawned = self.spawned.lock();
            let id = 1_000 + spawned.len() as u64;
            spawned.push(id);
            id
        };
        let (host, worker) = MessageChannel::new().into_ports();
        let task = tokio::spawn(async move {
            let _ = worker.post_json(json!({ "type": "WORKER_READY", "ready": true }));
            let mut held = Vec::new();
            while let Some(message) = worker.recv().await {
                held.extend(message.ports);
            }
        });
        Ok(SpawnedWorker {
            id,
            port: host,
            task: task.abort_handle(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_attach_times_out_and_forfeits_the_worker() {
    let spawner = Arc::new(SilentSpawner::default());
    let pool = SignerWorkerPool::new(pool_config(1), Arc::clone(&spawner) as Arc<dyn WorkerSpawner>);
    pool.fill().await.unwrap();
    let before = pool.idle_worker_ids();
    assert_eq!(before.len(), 1);

    let err = pool.reserve_session("s2").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Session(SessionError::HandshakeTimeout { ref session_id, timeout })
            if session_id == "s2" && timeout == Duration::from_secs(2)
    ));
    assert_eq!(err.to_error_payload().code, "HANDSHAKE_TIMEOUT");
    assert!(!pool.has_session("s2"));
    assert!(!pool.idle_worker_ids().contains(&before[0]));

    // The replacement brings the pool back to its previous size.
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.fill().await.unwrap();
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.live_count(), 1);
    assert_ne!(pool.idle_worker_ids(), before);
}

#[tokio::test]
async fn second_reservation_of_same_id_fails() {
    let pool = SignerWorkerPool::new(pool_config(2), Arc::new(InProcessSignerSpawner));
    let _port = pool.reserve_session("s1").await.unwrap();
    let idle_before = pool.idle_worker_ids();
    let live_before = pool.live_count();

    let err = pool.reserve_session("s1").await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::AlreadyExists { .. })));
    assert_eq!(pool.idle_worker_ids(), idle_before);
    assert_eq!(pool.live_count(), live_before);
    assert_eq!(pool.session_count(), 1);
}

#[tokio::test]
async fn seed_port_closed_without_delivery_releases_the_session() {
    let pool = SignerWorkerPool::new(pool_config(1), Arc::new(InProcessSignerSpawner));
    let seed_port = pool.reserve_session("s1").await.unwrap();
    seed_port.close();

    let err = pool
        .send_message("s1", derive_request("s1"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Session(SessionError::SeedUnavailable { ref session_id, .. }) if session_id == "s1"
    ));
    assert_eq!(err.to_error_payload().code, "SEED_UNAVAILABLE");
    assert!(!pool.has_session("s1"));
}

#[tokio::test(start_paused = true)]
async fn undelivered_seed_times_out_and_releases_the_session() {
    let pool = SignerWorkerPool::new(pool_config(1), Arc::new(InProcessSignerSpawner));
    let seed_port = pool.reserve_session("s1").await.unwrap();

    let err = pool
        .send_message("s1", derive_request("s1"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Session(SessionError::SeedUnavailable { ref reason, .. }) if reason.contains("not delivered")
    ));
    assert!(!pool.has_session("s1"));
    assert!(seed_port.recv().await.is_none(), "seed port left open");
}

/// How a scripted worker answers operations. Lifecycle messages are
/// always acknowledged and the seed is always reported ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    /// Never answers.
    Stall,
    /// Exits on the first operation.
    Crash,
    /// Answers with a `RESULT` that has no payload.
    Garbage,
    /// Echoes the nonce; nonce 0 fails.
    Echo,
}

/// Records the worker id when the worker task goes away.
struct ExitGuard {
    id: u64,
    exited: Arc<Mutex<Vec<u64>>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.exited.lock().push(self.id);
    }
}

struct ScriptedSpawner {
    behaviour: Behaviour,
    next_id: Mutex<u64>,
    exited: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedSpawner {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            next_id: Mutex::new(2_000),
            exited: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn has_exited(&self, id: u64) -> bool {
        self.exited.lock().contains(&id)
    }
}

async fn run_scripted(worker: Port, behaviour: Behaviour, _guard: ExitGuard) {
    let _ = worker.post_json(json!({ "type": "WORKER_READY", "ready": true }));
    let mut held = Vec::new();
    while let Some(mut message) = worker.recv().await {
        if message.kind() == Some("ATTACH_WRAP_KEY_SEED_PORT") {
            let session_id = message.data["sessionId"].clone();
            held.append(&mut message.ports);
            let _ = worker.post_json(
                json!({ "type": "ATTACH_WRAP_KEY_SEED_PORT_OK", "sessionId": session_id }),
            );
            let _ = worker.post_json(
                json!({ "type": "WRAP_KEY_SEED_READY", "sessionId": session_id, "ok": true }),
            );
            continue;
        }
        match behaviour {
            Behaviour::Stall => {}
            Behaviour::Crash => return,
            Behaviour::Garbage => {
                let _ = worker.post_json(json!({ "type": "RESULT" }));
            }
            Behaviour::Echo => {
                let nonce = message.data["payload"]["nonce"].clone();
                let reply = if nonce == 0 {
                    json!({ "type": "FAILURE", "error": "nonce rejected" })
                } else {
                    json!({ "type": "RESULT", "payload": { "nonce": nonce } })
                };
                let _ = worker.post_json(reply);
            }
        }
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self) -> Result<SpawnedWorker, WorkerError> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let guard = ExitGuard {
            id,
            exited: Arc::clone(&self.exited),
        };
        let (host, worker) = MessageChannel::new().into_ports();
        let task = tokio::spawn(run_scripted(worker, self.behaviour, guard));
        Ok(SpawnedWorker {
            id,
            port: host,
            task: task.abort_handle(),
        })
    }
}

fn scripted_pool(spawner: &Arc<ScriptedSpawner>) -> SignerWorkerPool {
    SignerWorkerPool::new(
        pool_config(1),
        Arc::clone(spawner) as Arc<dyn WorkerSpawner>,
    )
}

#[tokio::test(start_paused = true)]
async fn stalled_operation_times_out_and_releases_the_session() {
    let spawner = ScriptedSpawner::new(Behaviour::Stall);
    let pool = scripted_pool(&spawner);
    let seed_port = pool.reserve_session("s1").await.unwrap();
    let worker_id = pool.session_worker_id("s1").unwrap();

    let err = pool
        .send_message("s1", derive_request("s1"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Session(SessionError::OperationTimeout { ref session_id, timeout })
            if session_id == "s1" && timeout == pool.config().operation_timeout
    ));
    assert_eq!(err.to_error_payload().code, "OPERATION_TIMEOUT");
    assert!(!pool.has_session("s1"));
    assert!(seed_port.recv().await.is_none(), "seed port left open");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(spawner.has_exited(worker_id), "timed out worker still running");
    assert!(!pool.idle_worker_ids().contains(&worker_id));
}

#[tokio::test]
async fn crashed_worker_releases_the_session() {
    let spawner = ScriptedSpawner::new(Behaviour::Crash);
    let pool = scripted_pool(&spawner);
    let _seed_port = pool.reserve_session("s1").await.unwrap();
    let worker_id = pool.session_worker_id("s1").unwrap();

    let err = pool
        .send_message("s1", derive_request("s1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Worker(WorkerError::Crashed { worker_id: id }) if id == worker_id));
    assert!(!pool.has_session("s1"));
    assert_eq!(pool.session_count(), 0);
}

#[tokio::test]
async fn malformed_response_releases_the_session() {
    let spawner = ScriptedSpawner::new(Behaviour::Garbage);
    let pool = scripted_pool(&spawner);
    let _seed_port = pool.reserve_session("s1").await.unwrap();
    let worker_id = pool.session_worker_id("s1").unwrap();

    let err = pool
        .send_message("s1", derive_request("s1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Worker(WorkerError::MalformedResponse { .. })));
    assert!(!pool.has_session("s1"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(spawner.has_exited(worker_id));
}

#[tokio::test]
async fn stateless_workers_are_terminated_after_success_and_failure() {
    let spawner = ScriptedSpawner::new(Behaviour::Echo);
    let pool = scripted_pool(&spawner);

    pool.fill().await.unwrap();
    let borrowed = pool.idle_worker_ids()[0];
    let payload = pool.execute_stateless(stateless_request(9), None).await.unwrap();
    assert_eq!(payload["nonce"], 9);
    assert!(!pool.idle_worker_ids().contains(&borrowed));

    pool.fill().await.unwrap();
    let failing = pool.idle_worker_ids()[0];
    assert_ne!(failing, borrowed);
    let err = pool
        .execute_stateless(stateless_request(0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Worker(WorkerError::OperationFailed { .. })));
    assert!(!pool.idle_worker_ids().contains(&failing));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(spawner.has_exited(borrowed));
    assert!(spawner.has_exited(failing));
    assert_eq!(pool.session_count(), 0);
}

#[tokio::test]
async fn session_bound_request_is_refused_statelessly() {
    let spawner = ScriptedSpawner::new(Behaviour::Echo);
    let pool = scripted_pool(&spawner);
    let err = pool
        .execute_stateless(derive_request("s1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert_eq!(pool.live_count(), 0);
}
