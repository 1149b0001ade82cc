//! NEAR JSON-RPC access.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ChainError;
use crate::protocol::transaction::SignedTransaction;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u64,
    pub hash: String,
}

/// Nonce of an access key, at the block it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyView {
    pub nonce: u64,
    pub block: BlockInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeyInfo {
    pub public_key: String,
    pub nonce: u64,
    pub permission: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutcome {
    pub transaction_hash: String,
    pub status: Value,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block(&self) -> Result<BlockInfo, ChainError>;

    async fn view_access_key(
        &self,
        account_id: &str,
        public_key: &str,
    ) -> Result<AccessKeyView, ChainError>;

    async fn view_access_key_list(&self, account_id: &str) -> Result<Vec<AccessKeyInfo>, ChainError>;

    async fn send_transaction(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<TransactionOutcome, ChainError>;
}

/// JSON-RPC client over `reqwest`.
pub struct NearRpcClient {
    client: Client,
    url: String,
}

impl NearRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self, ChainError> {
        let client = Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "passkey-host",
            "method": method,
            "params": params,
        });
        let response = self.client.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChainError::RequestFailed {
                method: method.to_string(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let envelope: RpcEnvelope<T> = response.json().await?;
        match (envelope.result, envelope.error) {
            (_, Some(error)) => Err(ChainError::Rpc {
                method: method.to_string(),
                message: error.describe(),
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ChainError::RequestFailed {
                method: method.to_string(),
                reason: "response carried neither result nor error".to_string(),
            }),
        }
    }
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcErrorBody {
    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(name) = &self.name {
            parts.push(name.clone());
        }
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        if let Some(data) = &self.data {
            parts.push(data.to_string());
        }
        if parts.is_empty() {
            "unknown RPC error".to_string()
        } else {
            parts.join(": ")
        }
    }
}

#[derive(Deserialize)]
struct BlockResult {
    header: BlockHeader,
}

#[derive(Deserialize)]
struct BlockHeader {
    height: u64,
    hash: String,
}

#[derive(Deserialize)]
struct AccessKeyResult {
    nonce: u64,
    block_height: u64,
    block_hash: String,
    /// Query errors arrive inside `result` for some node versions.
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct AccessKeyListResult {
    keys: Vec<AccessKeyListEntry>,
}

#[derive(Deserialize)]
struct AccessKeyListEntry {
    public_key: String,
    access_key: RawAccessKey,
}

#[derive(Deserialize)]
struct RawAccessKey {
    nonce: u64,
    permission: Value,
}

#[derive(Deserialize)]
struct TxResult {
    #[serde(default)]
    status: Value,
    transaction: TxRef,
}

#[derive(Deserialize)]
struct TxRef {
    hash: String,
}

#[async_trait]
impl ChainClient for NearRpcClient {
    async fn latest_block(&self) -> Result<BlockInfo, ChainError> {
        let block: BlockResult = self.call("block", json!({ "finality": "final" })).await?;
        Ok(BlockInfo {
            height: block.header.height,
            hash: block.header.hash,
        })
    }

    async fn view_access_key(
        &self,
        account_id: &str,
        public_key: &str,
    ) -> Result<AccessKeyView, ChainError> {
        let result: AccessKeyResult = self
            .call(
                "query",
                json!({
                    "request_type": "view_access_key",
                    "finality": "final",
                    "account_id": account_id,
                    "public_key": public_key,
                }),
            )
            .await?;
        if let Some(error) = result.error {
            return Err(ChainError::Rpc {
                method: "query".to_string(),
                message: error,
            });
        }
        Ok(AccessKeyView {
            nonce: result.nonce,
            block: BlockInfo {
                height: result.block_height,
                hash: result.block_hash,
            },
        })
    }

    async fn view_access_key_list(&self, account_id: &str) -> Result<Vec<AccessKeyInfo>, ChainError> {
        let result: AccessKeyListResult = self
            .call(
                "query",
                json!({
                    "request_type": "view_access_key_list",
                    "finality": "final",
                    "account_id": account_id,
                }),
            )
            .await?;
        Ok(result
            .keys
            .into_iter()
            .map(|k| AccessKeyInfo {
                public_key: k.public_key,
                nonce: k.access_key.nonce,
                permission: k.access_key.permission,
            })
            .collect())
    }

    async fn send_transaction(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<TransactionOutcome, ChainError> {
        let encoded = serde_json::to_vec(transaction).map_err(|e| ChainError::RequestFailed {
            method: "send_tx".to_string(),
            reason: e.to_string(),
        })?;
        let result: TxResult = self
            .call(
                "send_tx",
                json!({
                    "signed_tx_base64": STANDARD.encode(encoded),
                    "wait_until": "EXECUTED_OPTIMISTIC",
                }),
            )
            .await?;
        tracing::info!(tx_hash = %result.transaction.hash, "Transaction broadcast");
        Ok(TransactionOutcome {
            transaction_hash: result.transaction.hash,
            status: result.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_description_joins_parts() {
        let body: RpcErrorBody = serde_json::from_value(json!({
            "name": "HANDLER_ERROR",
            "message": "Server error",
        }))
        .unwrap();
        assert_eq!(body.describe(), "HANDLER_ERROR: Server error");
    }

    #[test]
    fn access_key_list_parses_node_shape() {
        let parsed: AccessKeyListResult = serde_json::from_value(json!({
            "keys": [{
                "public_key": "ed25519:abc",
                "access_key": { "nonce": 7, "permission": "FullAccess" }
            }],
            "block_height": 1,
            "block_hash": "h"
        }))
        .unwrap();
        assert_eq!(parsed.keys[0].access_key.nonce, 7);
    }
}
