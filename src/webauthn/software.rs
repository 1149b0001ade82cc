//! In-process authenticator.
//!
//! Holds one credential per (relying party, user). PRF results come from
//! HKDF over a per-credential secret, so the same credential and salt always
//! give the same output.

use std::collections::HashMap;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use parking_lot::Mutex;
use secrecy::SecretSlice;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::CeremonyError;
use crate::webauthn::{
    CeremonyCredential, CeremonyKind, CeremonyRequest, PlatformAuthenticator, PrfOutputs,
};
use crate::worker::crypto;

struct StoredCredential {
    id: String,
    rp_id: String,
    user_id: String,
    key: SigningKey,
    prf_secret: [u8; 32],
    sign_count: u32,
}

#[derive(Default)]
pub struct SoftwareAuthenticator {
    credentials: Mutex<Vec<StoredCredential>>,
    /// Next `get` fails with this error, once.
    fail_next: Mutex<Option<CeremonyError>>,
}

impl SoftwareAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credential_count(&self) -> usize {
        self.credentials.lock().len()
    }

    /// Make the next ceremony fail as if the user dismissed the prompt.
    pub fn fail_next(&self, error: CeremonyError) {
        *self.fail_next.lock() = Some(error);
    }

    fn take_failure(&self) -> Result<(), CeremonyError> {
        match self.fail_next.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn prf_eval(secret: &[u8; 32], salt: &[u8; 32]) -> Result<SecretSlice<u8>, CeremonyError> {
    let mut out = vec![0u8; 32];
    Hkdf::<Sha256>::new(Some(salt), secret)
        .expand(b"webauthn-prf", &mut out)
        .map_err(|_| CeremonyError::Failed("PRF evaluation failed".to_string()))?;
    Ok(SecretSlice::from(out))
}

fn client_data(kind: CeremonyKind, request: &CeremonyRequest) -> Vec<u8> {
    let ty = match kind {
        CeremonyKind::Create => "webauthn.create",
        CeremonyKind::Get => "webauthn.get",
    };
    json!({
        "type": ty,
        "challenge": crypto::b64u_encode(&request.challenge),
        "origin": format!("https://{}", request.rp_id),
    })
    .to_string()
    .into_bytes()
}

fn authenticator_data(rp_id: &str, sign_count: u32) -> Vec<u8> {
    let mut data = Sha256::digest(rp_id.as_bytes()).to_vec();
    data.push(0x05);
    data.extend_from_slice(&sign_count.to_be_bytes());
    data
}

#[async_trait]
impl PlatformAuthenticator for SoftwareAuthenticator {
    async fn create(&self, request: &CeremonyRequest) -> Result<CeremonyCredential, CeremonyError> {
        self.take_failure()?;
        let key = SigningKey::from_bytes(&crypto::random_bytes::<32>());
        let prf_secret = crypto::random_bytes::<32>();
        let id = crypto::b64u_encode(&crypto::random_bytes::<16>());

        let prf = PrfOutputs {
            first: prf_eval(&prf_secret, &request.salts.first)?,
            second: Some(prf_eval(&prf_secret, &request.salts.second)?),
        };
        let credential = CeremonyCredential {
            kind: CeremonyKind::Create,
            id: id.clone(),
            user_handle: Some(request.user_id.clone()),
            client_data_json: client_data(CeremonyKind::Create, request),
            authenticator_data: authenticator_data(&request.rp_id, 0),
            signature: None,
            public_key: Some(crypto::public_key_string(&key.verifying_key())),
            prf: Some(prf),
        };

        let mut credentials = self.credentials.lock();
        credentials.retain(|c| !(c.rp_id == request.rp_id && c.user_id == request.user_id));
        credentials.push(StoredCredential {
            id,
            rp_id: request.rp_id.clone(),
            user_id: request.user_id.clone(),
            key,
            prf_secret,
            sign_count: 0,
        });
        Ok(credential)
    }

    async fn get(&self, request: &CeremonyRequest) -> Result<CeremonyCredential, CeremonyError> {
        self.take_failure()?;
        let mut credentials = self.credentials.lock();
        let stored = credentials
            .iter_mut()
            .find(|c| {
                c.rp_id == request.rp_id
                    && if request.allow_credentials.is_empty() {
                        request.user_id.is_empty() || c.user_id == request.user_id
                    } else {
                        request.allow_credentials.contains(&c.id)
                    }
            })
            .ok_or_else(|| {
                CeremonyError::NotAllowed("no matching credential on this device".to_string())
            })?;

        // Discoverable assertions evaluate PRF with the credential's own account.
        let salts = if request.user_id.is_empty() {
            crate::webauthn::PrfSalts::for_account(&stored.user_id)
        } else {
            request.salts.clone()
        };

        stored.sign_count += 1;
        let client_data_json = client_data(CeremonyKind::Get, request);
        let auth_data = authenticator_data(&request.rp_id, stored.sign_count);
        let mut signed = auth_data.clone();
        signed.extend_from_slice(&Sha256::digest(&client_data_json));
        let signature = stored.key.sign(&signed).to_bytes().to_vec();

        Ok(CeremonyCredential {
            kind: CeremonyKind::Get,
            id: stored.id.clone(),
            user_handle: Some(stored.user_id.clone()),
            client_data_json,
            authenticator_data: auth_data,
            signature: Some(signature),
            public_key: None,
            prf: Some(PrfOutputs {
                first: prf_eval(&stored.prf_secret, &salts.first)?,
                second: Some(prf_eval(&stored.prf_secret, &salts.second)?),
            }),
        })
    }
}
