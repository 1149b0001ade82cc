//! State owned by the wallet host's router.

use std::sync::Arc;

use tokio::task::AbortHandle;

use crate::channel::{ContextRef, Port};
use crate::client::{ClientEnvironment, WalletClient};
use crate::config::{HostConfig, HostConfigPatch};
use crate::error::{ConfigError, Result};
use crate::protocol::AppMessage;

/// Everything the router mutates.
///
/// Created once per wallet context. Reconfiguration resets the lazily built
/// client and preference subscription but keeps the adopted channel.
pub struct HostContext {
    parent: ContextRef,
    parent_origin: Option<String>,
    port: Option<Arc<Port>>,
    patch: HostConfigPatch,
    env: ClientEnvironment,
    client: Option<Arc<WalletClient>>,
    preference_subscription: Option<AbortHandle>,
}

impl HostContext {
    /// `base` is the env layer; `PM_SET_CONFIG` patches go on top of it.
    pub fn create(parent: ContextRef, base: HostConfigPatch, env: ClientEnvironment) -> Self {
        Self {
            parent,
            parent_origin: None,
            port: None,
            patch: base,
            env,
            client: None,
            preference_subscription: None,
        }
    }

    pub fn parent(&self) -> &ContextRef {
        &self.parent
    }

    pub fn parent_origin(&self) -> Option<&str> {
        self.parent_origin.as_deref()
    }

    pub fn port(&self) -> Option<Arc<Port>> {
        self.port.clone()
    }

    pub fn env(&self) -> &ClientEnvironment {
        &self.env
    }

    pub fn patch(&self) -> &HostConfigPatch {
        &self.patch
    }

    /// Take over `port` as the app channel. A previous channel is closed.
    pub fn adopt_channel(&mut self, origin: String, port: Port) -> Arc<Port> {
        if let Some(previous) = self.port.take() {
            previous.close();
        }
        let port = Arc::new(port);
        self.parent_origin = Some(origin);
        self.port = Some(Arc::clone(&port));
        self.subscribe_preferences();
        port
    }

    /// The client for the current configuration, built on first use.
    pub fn client(&mut self) -> Result<Arc<WalletClient>> {
        if let Some(client) = &self.client {
            return Ok(Arc::clone(client));
        }
        let config = HostConfig::resolve(&self.patch)?;
        let client = Arc::new(WalletClient::new(config, &self.env)?);
        self.client = Some(Arc::clone(&client));
        Ok(client)
    }

    /// The client if it has already been built.
    pub fn existing_client(&self) -> Option<Arc<WalletClient>> {
        self.client.clone()
    }

    /// Merge `update` into the accumulated settings and drop the client.
    ///
    /// Validation runs on the merged result before anything is committed, so
    /// a bad patch leaves the previous configuration in place.
    pub fn reset_on_reconfigure(&mut self, update: HostConfigPatch) -> std::result::Result<(), ConfigError> {
        let mut merged = self.patch.clone();
        merged.merge(update.clone());
        let resolved = HostConfig::resolve(&merged)?;
        self.patch = merged;

        if let Some(client) = self.client.take() {
            client.shutdown();
        }
        self.subscribe_preferences();

        if let Some(confirmation) = &update.confirmation {
            if confirmation.behavior.is_some() {
                self.env
                    .preferences
                    .set_confirm_behavior(resolved.confirmation.behavior);
            }
            if confirmation.theme.is_some() {
                self.env.preferences.set_theme(resolved.confirmation.theme);
            }
        }
        tracing::info!(
            contract_id = %resolved.contract_id,
            "Host reconfigured"
        );
        Ok(())
    }

    fn subscribe_preferences(&mut self) {
        if let Some(previous) = self.preference_subscription.take() {
            previous.abort();
        }
        let (Some(port), Ok(runtime)) = (self.port.clone(), tokio::runtime::Handle::try_current())
        else {
            return;
        };
        let mut rx = self.env.preferences.subscribe();
        rx.mark_unchanged();
        let task = runtime.spawn(async move {
            while rx.changed().await.is_ok() {
                let prefs = *rx.borrow_and_update();
                let message = AppMessage::PreferencesChanged {
                    payload: serde_json::to_value(prefs).unwrap_or_default(),
                };
                let Ok(data) = serde_json::to_value(&message) else {
                    continue;
                };
                if port.post_json(data).is_err() {
                    break;
                }
            }
        });
        self.preference_subscription = Some(task.abort_handle());
    }

    pub fn has_preference_subscription(&self) -> bool {
        self.preference_subscription
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Release the client, the subscription and the channel.
    pub fn teardown(&mut self) {
        if let Some(subscription) = self.preference_subscription.take() {
            subscription.abort();
        }
        if let Some(client) = self.client.take() {
            client.shutdown();
        }
        if let Some(port) = self.port.take() {
            port.close();
        }
        self.parent_origin = None;
        tracing::debug!("Host context torn down");
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
