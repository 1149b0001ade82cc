//! Transaction inputs as the application submits them.

use serde::{Deserialize, Serialize};

/// One action inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ActionArgs {
    CreateAccount,
    Transfer {
        deposit: String,
    },
    FunctionCall {
        method_name: String,
        args: serde_json::Value,
        gas: String,
        deposit: String,
    },
    AddKey {
        public_key: String,
        access_key: AccessKeyArgs,
    },
    DeleteKey {
        public_key: String,
    },
    DeleteAccount {
        beneficiary_id: String,
    },
}

impl ActionArgs {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateAccount => "CreateAccount",
            Self::Transfer { .. } => "Transfer",
            Self::FunctionCall { .. } => "FunctionCall",
            Self::AddKey { .. } => "AddKey",
            Self::DeleteKey { .. } => "DeleteKey",
            Self::DeleteAccount { .. } => "DeleteAccount",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeyArgs {
    #[serde(default)]
    pub nonce: u64,
    pub permission: AccessKeyPermission,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AccessKeyPermission {
    FullAccess,
    FunctionCall {
        receiver_id: String,
        #[serde(default)]
        method_names: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowance: Option<String>,
    },
}

/// A receiver plus its ordered actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInput {
    pub receiver_id: String,
    pub actions: Vec<ActionArgs>,
}

/// A transaction signed inside a signer worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub signer_id: String,
    pub public_key: String,
    pub nonce: u64,
    pub receiver_id: String,
    pub block_hash: String,
    pub actions: Vec<ActionArgs>,
    /// base64url sha256 of the canonical signing payload.
    pub hash: String,
    /// base64url ed25519 signature over `hash`.
    pub signature: String,
}
