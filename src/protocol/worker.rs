//! Messages between the host and its worker execution contexts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::transaction::{SignedTransaction, TransactionInput};

pub const ATTACH_WRAP_KEY_SEED_PORT: &str = "ATTACH_WRAP_KEY_SEED_PORT";
pub const ATTACH_WRAP_KEY_SEED_PORT_OK: &str = "ATTACH_WRAP_KEY_SEED_PORT_OK";
pub const ATTACH_WRAP_KEY_SEED_PORT_ERROR: &str = "ATTACH_WRAP_KEY_SEED_PORT_ERROR";
pub const WORKER_READY: &str = "WORKER_READY";
pub const WRAP_KEY_SEED_READY: &str = "WRAP_KEY_SEED_READY";

pub const RESPONSE_PROGRESS: &str = "PROGRESS";
pub const RESPONSE_RESULT: &str = "RESULT";
pub const RESPONSE_FAILURE: &str = "FAILURE";

/// A private key encrypted under the session's key-encryption key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyData {
    pub encrypted_key: String,
    pub iv: String,
    pub wrap_key_salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeriveKeypairRequest {
    pub session_id: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DecryptKeyRequest {
    pub session_id: String,
    pub account_id: String,
    pub encrypted: EncryptedKeyData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignTransactionsRequest {
    pub session_id: String,
    pub signer_id: String,
    pub encrypted: EncryptedKeyData,
    pub transactions: Vec<TransactionInput>,
    /// Nonce for the first transaction; later ones increment from it.
    pub nonce: u64,
    pub block_hash: String,
    /// Digest the user approved. The worker refuses to sign anything else.
    pub intent_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignNep413Request {
    pub session_id: String,
    pub account_id: String,
    pub encrypted: EncryptedKeyData,
    pub message: String,
    pub recipient: String,
    /// base64url, 32 bytes.
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Sign with a caller-supplied key; no session, no seed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignWithKeyPairRequest {
    /// `ed25519:<base64url secret>`.
    pub private_key: String,
    pub signer_id: String,
    pub transactions: Vec<TransactionInput>,
    pub nonce: u64,
    pub block_hash: String,
}

/// Operations a signer worker performs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerRequest {
    DeriveKeypairAndEncrypt(DeriveKeypairRequest),
    DecryptPrivateKeyWithPrf(DecryptKeyRequest),
    SignTransactionsWithActions(SignTransactionsRequest),
    SignNep413Message(SignNep413Request),
    SignTransactionWithKeyPair(SignWithKeyPairRequest),
}

impl WorkerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeriveKeypairAndEncrypt(_) => "DERIVE_KEYPAIR_AND_ENCRYPT",
            Self::DecryptPrivateKeyWithPrf(_) => "DECRYPT_PRIVATE_KEY_WITH_PRF",
            Self::SignTransactionsWithActions(_) => "SIGN_TRANSACTIONS_WITH_ACTIONS",
            Self::SignNep413Message(_) => "SIGN_NEP413_MESSAGE",
            Self::SignTransactionWithKeyPair(_) => "SIGN_TRANSACTION_WITH_KEYPAIR",
        }
    }

    /// Session the operation is bound to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::DeriveKeypairAndEncrypt(r) => Some(&r.session_id),
            Self::DecryptPrivateKeyWithPrf(r) => Some(&r.session_id),
            Self::SignTransactionsWithActions(r) => Some(&r.session_id),
            Self::SignNep413Message(r) => Some(&r.session_id),
            Self::SignTransactionWithKeyPair(_) => None,
        }
    }
}

/// What a worker posts back for an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerResponse {
    Progress { payload: Value },
    Result { payload: Value },
    Failure { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DerivedKeypair {
    pub public_key: String,
    pub encrypted: EncryptedKeyData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedKeypair {
    pub account_id: String,
    pub public_key: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransactions {
    pub transactions: Vec<SignedTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    pub account_id: String,
    pub public_key: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// One-shot seed delivery from the VRF worker to a signer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedDelivery {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_key_seed: Option<String>,
    #[serde(rename = "wrapKeySalt", default, skip_serializing_if = "Option::is_none")]
    pub wrap_key_salt: Option<String>,
    #[serde(rename = "prfSecond", default, skip_serializing_if = "Option::is_none")]
    pub prf_second: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Inputs a VRF challenge is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VrfInputData {
    pub user_id: String,
    pub rp_id: String,
    pub session_id: String,
    pub block_height: u64,
    pub block_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VrfChallenge {
    #[serde(flatten)]
    pub input: VrfInputData,
    pub vrf_input: String,
    pub vrf_output: String,
    pub vrf_proof: String,
    pub vrf_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedSessionRequest {
    pub session_id: String,
}

/// PRF output handed to the VRF worker; it derives the seed itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliverSeedRequest {
    pub session_id: String,
    pub account_id: String,
    /// base64url.
    pub prf_first: String,
    /// Existing account salt; a fresh one is drawn when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_key_salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prf_second: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailSeedRequest {
    pub session_id: String,
    pub error: String,
}

/// What the VRF worker acknowledges after a delivery. Never the seed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedReceipt {
    pub session_id: String,
    pub wrap_key_salt: String,
}

/// Operations the VRF worker performs.
///
/// `FAIL_WRAP_KEY_SEED_SESSION` is a notification and gets no response.
/// `ATTACH_VRF_SEED_PORT` carries the port in the message's transfer list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VrfRequest {
    GenerateVrfChallenge(VrfInputData),
    AttachVrfSeedPort(SeedSessionRequest),
    DeliverWrapKeySeed(DeliverSeedRequest),
    FailWrapKeySeedSession(FailSeedRequest),
}

impl VrfRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GenerateVrfChallenge(_) => "GENERATE_VRF_CHALLENGE",
            Self::AttachVrfSeedPort(_) => "ATTACH_VRF_SEED_PORT",
            Self::DeliverWrapKeySeed(_) => "DELIVER_WRAP_KEY_SEED",
            Self::FailWrapKeySeedSession(_) => "FAIL_WRAP_KEY_SEED_SESSION",
        }
    }
}
