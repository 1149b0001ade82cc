//! Typed request handlers.
//!
//! One arm per request type. Control requests (`PING`, `PM_SET_CONFIG`,
//! `PM_CANCEL`) never reach this table; the router handles them directly.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::client::preferences::PreferenceStore;
use crate::client::{Progress, WalletClient};
use crate::error::{Error, Result};
use crate::protocol::HostRequest;

/// What a handler may touch.
pub struct HandlerScope {
    /// Present when the request needs it and the configuration resolved.
    pub client: Option<Arc<WalletClient>>,
    pub preferences: Arc<PreferenceStore>,
    pub progress: Progress,
    pub cancel: CancellationToken,
}

impl HandlerScope {
    fn client(&self) -> Result<&WalletClient> {
        self.client
            .as_deref()
            .ok_or_else(|| Error::InvalidRequest("wallet client unavailable".to_string()))
    }
}

/// Whether `request` needs a constructed client.
pub fn needs_client(request: &HostRequest) -> bool {
    !matches!(
        request,
        HostRequest::Ping
            | HostRequest::SetConfig(_)
            | HostRequest::Cancel { .. }
            | HostRequest::SetConfirmBehavior(_)
            | HostRequest::SetTheme(_)
    )
}

fn to_result<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::InvalidRequest(format!("result could not be serialized: {e}")))
}

pub async fn handle(scope: HandlerScope, request: HostRequest) -> Result<Value> {
    let progress = &scope.progress;
    let cancel = &scope.cancel;
    match request {
        HostRequest::GetCapabilities => to_result(scope.client()?.capabilities()),
        HostRequest::Register(p) => {
            to_result(scope.client()?.register(&p.near_account_id, progress, cancel).await?)
        }
        HostRequest::Login(p) => {
            to_result(scope.client()?.login(&p.near_account_id, progress, cancel).await?)
        }
        HostRequest::Logout => to_result(scope.client()?.logout().await),
        HostRequest::GetLoginState => to_result(scope.client()?.login_state().await),
        HostRequest::SignAndSendTxs(p) => to_result(
            scope
                .client()?
                .sign_and_send(&p.near_account_id, p.transactions, progress, cancel)
                .await?,
        ),
        HostRequest::ExportKeypair(p) => to_result(
            scope
                .client()?
                .export_keypair(&p.near_account_id, progress, cancel)
                .await?,
        ),
        HostRequest::ViewAccessKeys(p) => {
            let keys = scope.client()?.view_access_keys(&p.near_account_id).await?;
            Ok(json!({ "accountId": p.near_account_id, "keys": to_result(keys)? }))
        }
        HostRequest::LinkDevice(p) => to_result(
            scope
                .client()?
                .link_device(&p.near_account_id, progress, cancel)
                .await?,
        ),
        HostRequest::RecoverAccount(p) => to_result(
            scope
                .client()?
                .recover_account(p.near_account_id.as_deref(), progress, cancel)
                .await?,
        ),
        HostRequest::SetConfirmBehavior(p) => {
            scope.preferences.set_confirm_behavior(p.behavior);
            to_result(scope.preferences.get())
        }
        HostRequest::SetTheme(p) => {
            scope.preferences.set_theme(p.theme);
            to_result(scope.preferences.get())
        }
        HostRequest::Ping | HostRequest::SetConfig(_) | HostRequest::Cancel { .. } => Err(
            Error::InvalidRequest(format!("{} is a control request", request.type_name())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Theme;
    use crate::protocol::envelope::{AccountPayload, ThemePayload};

    fn scope(preferences: Arc<PreferenceStore>) -> HandlerScope {
        HandlerScope {
            client: None,
            preferences,
            progress: Progress::none(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn theme_is_applied_without_a_client() {
        let preferences = Arc::new(PreferenceStore::default());
        let result = handle(
            scope(Arc::clone(&preferences)),
            HostRequest::SetTheme(ThemePayload { theme: Theme::Light }),
        )
        .await
        .unwrap();
        assert_eq!(result["theme"], "light");
        assert_eq!(preferences.get().theme, Theme::Light);
    }

    #[tokio::test]
    async fn client_requests_fail_cleanly_without_client() {
        let err = handle(
            scope(Arc::new(PreferenceStore::default())),
            HostRequest::Login(AccountPayload {
                near_account_id: "alice.testnet".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_error_payload().code, "INVALID_REQUEST");
    }

    #[test]
    fn preference_requests_do_not_need_a_client() {
        assert!(!needs_client(&HostRequest::SetTheme(ThemePayload {
            theme: Theme::Dark
        })));
        assert!(needs_client(&HostRequest::GetLoginState));
    }
}
