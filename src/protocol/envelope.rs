//! Envelopes exchanged between the embedding application and the wallet host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ConfirmBehavior, HostConfigPatch, Theme};
use crate::error::ErrorPayload;
use crate::protocol::transaction::TransactionInput;

/// Wire protocol version announced in `READY`.
pub const PROTOCOL_VERSION: &str = "1.0.0";

pub const TYPE_CONNECT: &str = "CONNECT";
pub const TYPE_PING: &str = "PING";
pub const TYPE_SET_CONFIG: &str = "PM_SET_CONFIG";
pub const TYPE_CANCEL: &str = "PM_CANCEL";
pub const TYPE_GET_CAPABILITIES: &str = "PM_GET_CAPABILITIES";
pub const TYPE_REGISTER: &str = "PM_REGISTER";
pub const TYPE_LOGIN: &str = "PM_LOGIN";
pub const TYPE_LOGOUT: &str = "PM_LOGOUT";
pub const TYPE_GET_LOGIN_STATE: &str = "PM_GET_LOGIN_STATE";
pub const TYPE_SIGN_AND_SEND_TXS: &str = "PM_SIGN_AND_SEND_TXS";
pub const TYPE_EXPORT_KEYPAIR: &str = "PM_EXPORT_NEAR_KEYPAIR";
pub const TYPE_VIEW_ACCESS_KEYS: &str = "PM_VIEW_ACCESS_KEYS";
pub const TYPE_LINK_DEVICE: &str = "PM_LINK_DEVICE";
pub const TYPE_RECOVER_ACCOUNT: &str = "PM_RECOVER_ACCOUNT";
pub const TYPE_SET_CONFIRM_BEHAVIOR: &str = "PM_SET_CONFIRM_BEHAVIOR";
pub const TYPE_SET_THEME: &str = "PM_SET_THEME";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountPayload {
    pub near_account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignAndSendPayload {
    pub near_account_id: String,
    pub transactions: Vec<TransactionInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecoverAccountPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBehaviorPayload {
    pub behavior: ConfirmBehavior,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThemePayload {
    pub theme: Theme,
}

/// A typed host-ward request.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    Ping,
    SetConfig(HostConfigPatch),
    Cancel { target: Option<String> },
    GetCapabilities,
    Register(AccountPayload),
    Login(AccountPayload),
    Logout,
    GetLoginState,
    SignAndSendTxs(SignAndSendPayload),
    ExportKeypair(AccountPayload),
    ViewAccessKeys(AccountPayload),
    LinkDevice(AccountPayload),
    RecoverAccount(RecoverAccountPayload),
    SetConfirmBehavior(ConfirmBehaviorPayload),
    SetTheme(ThemePayload),
}

impl HostRequest {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ping => TYPE_PING,
            Self::SetConfig(_) => TYPE_SET_CONFIG,
            Self::Cancel { .. } => TYPE_CANCEL,
            Self::GetCapabilities => TYPE_GET_CAPABILITIES,
            Self::Register(_) => TYPE_REGISTER,
            Self::Login(_) => TYPE_LOGIN,
            Self::Logout => TYPE_LOGOUT,
            Self::GetLoginState => TYPE_GET_LOGIN_STATE,
            Self::SignAndSendTxs(_) => TYPE_SIGN_AND_SEND_TXS,
            Self::ExportKeypair(_) => TYPE_EXPORT_KEYPAIR,
            Self::ViewAccessKeys(_) => TYPE_VIEW_ACCESS_KEYS,
            Self::LinkDevice(_) => TYPE_LINK_DEVICE,
            Self::RecoverAccount(_) => TYPE_RECOVER_ACCOUNT,
            Self::SetConfirmBehavior(_) => TYPE_SET_CONFIRM_BEHAVIOR,
            Self::SetTheme(_) => TYPE_SET_THEME,
        }
    }

    fn decode(kind: &str, payload: Value) -> Option<Result<Self, serde_json::Error>> {
        fn typed<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, serde_json::Error> {
            serde_json::from_value(payload)
        }

        let request = match kind {
            TYPE_PING => Ok(Self::Ping),
            TYPE_SET_CONFIG => typed(payload).map(Self::SetConfig),
            TYPE_CANCEL => {
                let payload = if payload.is_null() {
                    Ok(CancelPayload { request_id: None })
                } else {
                    typed::<CancelPayload>(payload)
                };
                payload.map(|p| Self::Cancel {
                    target: p.request_id,
                })
            }
            TYPE_GET_CAPABILITIES => Ok(Self::GetCapabilities),
            TYPE_REGISTER => typed(payload).map(Self::Register),
            TYPE_LOGIN => typed(payload).map(Self::Login),
            TYPE_LOGOUT => Ok(Self::Logout),
            TYPE_GET_LOGIN_STATE => Ok(Self::GetLoginState),
            TYPE_SIGN_AND_SEND_TXS => typed(payload).map(Self::SignAndSendTxs),
            TYPE_EXPORT_KEYPAIR => typed(payload).map(Self::ExportKeypair),
            TYPE_VIEW_ACCESS_KEYS => typed(payload).map(Self::ViewAccessKeys),
            TYPE_LINK_DEVICE => typed(payload).map(Self::LinkDevice),
            TYPE_RECOVER_ACCOUNT => {
                let payload = if payload.is_null() {
                    Ok(RecoverAccountPayload {
                        near_account_id: None,
                    })
                } else {
                    typed(payload)
                };
                payload.map(Self::RecoverAccount)
            }
            TYPE_SET_CONFIRM_BEHAVIOR => typed(payload).map(Self::SetConfirmBehavior),
            TYPE_SET_THEME => typed(payload).map(Self::SetTheme),
            _ => return None,
        };
        Some(request)
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Outcome of decoding one inbound message.
#[derive(Debug)]
pub enum InboundEnvelope {
    Request {
        request_id: Option<String>,
        request: HostRequest,
    },
    /// Known type with an undecodable payload.
    Invalid {
        request_id: Option<String>,
        kind: String,
        reason: String,
    },
    /// Not an envelope, or a type this host does not know. Ignored.
    Unknown { kind: Option<String> },
}

pub fn decode_envelope(data: &Value) -> InboundEnvelope {
    let raw: RawEnvelope = match serde_json::from_value(data.clone()) {
        Ok(raw) => raw,
        Err(_) => {
            return InboundEnvelope::Unknown {
                kind: data.get("type").and_then(|v| v.as_str()).map(String::from),
            };
        }
    };

    match HostRequest::decode(&raw.kind, raw.payload) {
        None => InboundEnvelope::Unknown {
            kind: Some(raw.kind),
        },
        Some(Ok(request)) => InboundEnvelope::Request {
            request_id: raw.request_id,
            request,
        },
        Some(Err(e)) => InboundEnvelope::Invalid {
            request_id: raw.request_id,
            kind: raw.kind,
            reason: e.to_string(),
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultPayload {
    pub ok: bool,
    pub result: Value,
}

/// App-ward messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum AppMessage {
    #[serde(rename = "READY")]
    Ready {
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
    },
    #[serde(rename = "PONG")]
    Pong {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "PROGRESS")]
    Progress {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: Value,
    },
    #[serde(rename = "PM_RESULT")]
    Result {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: ResultPayload,
    },
    #[serde(rename = "ERROR")]
    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: ErrorPayload,
    },
    #[serde(rename = "PREFERENCES_CHANGED")]
    PreferencesChanged { payload: Value },
}

impl AppMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Pong { request_id } | Self::Error { request_id, .. } => request_id.as_deref(),
            Self::Progress { request_id, .. } | Self::Result { request_id, .. } => {
                Some(request_id)
            }
            Self::Ready { .. } | Self::PreferencesChanged { .. } => None,
        }
    }

    /// Whether this message closes out its request id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error { .. })
    }
}
