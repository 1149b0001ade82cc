//! Account-creation relay.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub account_id: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_balance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountResponse {
    pub success: bool,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait AccountRelay: Send + Sync {
    async fn create_account(
        &self,
        request: &CreateAccountRequest,
    ) -> Result<CreateAccountResponse, RelayError>;
}

pub struct HttpRelay {
    client: Client,
    base_url: String,
}

impl HttpRelay {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RelayError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AccountRelay for HttpRelay {
    async fn create_account(
        &self,
        request: &CreateAccountRequest,
    ) -> Result<CreateAccountResponse, RelayError> {
        let url = format!("{}/create_account", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();
        let body: Option<CreateAccountResponse> = response.json().await.ok();

        match body {
            Some(body) if status.is_success() && body.success => {
                tracing::info!(
                    account_id = %request.account_id,
                    tx_hash = body.transaction_hash.as_deref().unwrap_or("-"),
                    "Relay created account"
                );
                Ok(body)
            }
            Some(body) => Err(RelayError::Rejected {
                account_id: request.account_id.clone(),
                message: body
                    .message
                    .unwrap_or_else(|| format!("HTTP {status}")),
            }),
            None => Err(RelayError::Rejected {
                account_id: request.account_id.clone(),
                message: format!("HTTP {status} with unreadable body"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_and_omits_balance() {
        let json = serde_json::to_value(CreateAccountRequest {
            account_id: "alice.testnet".to_string(),
            public_key: "ed25519:pk".to_string(),
            initial_balance: None,
        })
        .unwrap();
        assert_eq!(json["accountId"], "alice.testnet");
        assert!(json.get("initialBalance").is_none());
    }

    #[test]
    fn response_tolerates_missing_fields() {
        let parsed: CreateAccountResponse =
            serde_json::from_str(r#"{"success":false,"message":"taken"}"#).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.message.as_deref(), Some("taken"));
    }
}
