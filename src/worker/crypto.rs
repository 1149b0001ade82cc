//! Key derivation, key wrapping and signing used inside worker contexts.
//!
//! Derivations are HKDF-SHA256 with purpose-labelled `info` strings. Private
//! keys are wrapped with AES-256-GCM under a key-encryption key derived from
//! the session's wrap-key seed and a per-account salt.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::protocol::transaction::{ActionArgs, SignedTransaction, TransactionInput};

pub const KEY_PREFIX: &str = "ed25519:";

const WRAP_KEY_SEED_INFO: &[u8] = b"passkey-host/wrap-key-seed/v1";
const KEK_INFO: &[u8] = b"passkey-host/kek/v1";
const SIGNING_KEY_INFO: &[u8] = b"passkey-host/ed25519-signing-key/v1";
const NEP413_TAG: u32 = (1 << 31) + 413;

const AES_NONCE_LEN: usize = 12;
pub const WRAP_KEY_SALT_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("{field} is not valid base64url")]
    Encoding { field: &'static str },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("private key decryption failed")]
    Decrypt,

    #[error("key derivation failed")]
    Derivation,
}

pub fn b64u_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64u_decode(field: &'static str, value: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|_| CryptoError::Encoding { field })
}

fn hkdf_32(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::Derivation)?;
    Ok(okm)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Wrap-key seed from PRF.first, scoped to the account.
pub fn derive_wrap_key_seed(prf_first: &[u8], account_id: &str) -> Result<[u8; 32], CryptoError> {
    hkdf_32(account_id.as_bytes(), prf_first, WRAP_KEY_SEED_INFO)
}

/// Key-encryption key from the wrap-key seed and salt.
pub fn derive_kek(wrap_key_seed: &[u8], wrap_key_salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    hkdf_32(wrap_key_salt, wrap_key_seed, KEK_INFO)
}

/// Deterministic ed25519 key from PRF.second, scoped to the account.
pub fn derive_signing_key(prf_second: &[u8], account_id: &str) -> Result<SigningKey, CryptoError> {
    let seed = hkdf_32(account_id.as_bytes(), prf_second, SIGNING_KEY_INFO)?;
    Ok(SigningKey::from_bytes(&seed))
}

pub fn public_key_string(key: &VerifyingKey) -> String {
    format!("{KEY_PREFIX}{}", b64u_encode(key.as_bytes()))
}

pub fn parse_public_key(value: &str) -> Result<VerifyingKey, CryptoError> {
    let encoded = value.strip_prefix(KEY_PREFIX).unwrap_or(value);
    let bytes = b64u_decode("publicKey", encoded)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// `ed25519:` + base64url of secret || public (64 bytes).
pub fn private_key_string(key: &SigningKey) -> String {
    format!("{KEY_PREFIX}{}", b64u_encode(&key.to_keypair_bytes()))
}

pub fn parse_private_key(value: &str) -> Result<SigningKey, CryptoError> {
    let encoded = value.strip_prefix(KEY_PREFIX).unwrap_or(value);
    let bytes = b64u_decode("privateKey", encoded)?;
    match bytes.len() {
        32 | 64 => {
            let mut secret = [0u8; 32];
            secret.copy_from_slice(&bytes[..32]);
            Ok(SigningKey::from_bytes(&secret))
        }
        n => Err(CryptoError::InvalidKey(format!(
            "private key must be 32 or 64 bytes, got {n}"
        ))),
    }
}

/// Encrypt the signing key's secret half. Returns `(ciphertext, iv)` base64url.
pub fn encrypt_private_key(kek: &[u8; 32], key: &SigningKey) -> Result<(String, String), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(kek)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let iv = random_bytes::<AES_NONCE_LEN>();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), key.to_bytes().as_slice())
        .map_err(|_| CryptoError::Derivation)?;
    Ok((b64u_encode(&ciphertext), b64u_encode(&iv)))
}

pub fn decrypt_private_key(
    kek: &[u8; 32],
    encrypted_key: &str,
    iv: &str,
) -> Result<SigningKey, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(kek)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let iv = b64u_decode("iv", iv)?;
    if iv.len() != AES_NONCE_LEN {
        return Err(CryptoError::InvalidKey("iv must be 12 bytes".to_string()));
    }
    let ciphertext = b64u_decode("encryptedKey", encrypted_key)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| CryptoError::Decrypt)?;
    let secret: [u8; 32] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("decrypted key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&secret))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    signer_id: &'a str,
    public_key: &'a str,
    nonce: u64,
    receiver_id: &'a str,
    block_hash: &'a str,
    actions: &'a [ActionArgs],
}

fn signing_payload_hash(payload: &SigningPayload<'_>) -> Result<[u8; 32], CryptoError> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| CryptoError::InvalidKey(format!("unserializable transaction: {e}")))?;
    Ok(Sha256::digest(&bytes).into())
}

pub fn sign_transaction(
    key: &SigningKey,
    signer_id: &str,
    nonce: u64,
    block_hash: &str,
    transaction: &TransactionInput,
) -> Result<SignedTransaction, CryptoError> {
    let public_key = public_key_string(&key.verifying_key());
    let hash = signing_payload_hash(&SigningPayload {
        signer_id,
        public_key: &public_key,
        nonce,
        receiver_id: &transaction.receiver_id,
        block_hash,
        actions: &transaction.actions,
    })?;
    let signature = key.sign(&hash);

    Ok(SignedTransaction {
        signer_id: signer_id.to_string(),
        public_key,
        nonce,
        receiver_id: transaction.receiver_id.clone(),
        block_hash: block_hash.to_string(),
        actions: transaction.actions.clone(),
        hash: b64u_encode(&hash),
        signature: b64u_encode(&signature.to_bytes()),
    })
}

/// Check the signature and that `hash` covers the transaction fields.
pub fn verify_signed_transaction(signed: &SignedTransaction) -> bool {
    let Ok(public_key) = parse_public_key(&signed.public_key) else {
        return false;
    };
    let Ok(expected) = signing_payload_hash(&SigningPayload {
        signer_id: &signed.signer_id,
        public_key: &signed.public_key,
        nonce: signed.nonce,
        receiver_id: &signed.receiver_id,
        block_hash: &signed.block_hash,
        actions: &signed.actions,
    }) else {
        return false;
    };
    if b64u_encode(&expected) != signed.hash {
        return false;
    }
    let Ok(signature) = b64u_decode("signature", &signed.signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&signature) else {
        return false;
    };
    public_key.verify(&expected, &signature).is_ok()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Nep413Payload<'a> {
    message: &'a str,
    recipient: &'a str,
    nonce: &'a str,
}

/// NEP-413 style off-chain message signature.
pub fn sign_nep413(
    key: &SigningKey,
    message: &str,
    recipient: &str,
    nonce_b64u: &str,
) -> Result<String, CryptoError> {
    let nonce = b64u_decode("nonce", nonce_b64u)?;
    if nonce.len() != 32 {
        return Err(CryptoError::InvalidKey("nonce must be 32 bytes".to_string()));
    }
    let body = serde_json::to_vec(&Nep413Payload {
        message,
        recipient,
        nonce: nonce_b64u,
    })
    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(NEP413_TAG.to_le_bytes());
    hasher.update(&body);
    let hash: [u8; 32] = hasher.finalize().into();
    Ok(b64u_encode(&key.sign(&hash).to_bytes()))
}
