//! Confirmation surface bindings.
//!
//! A surface is whatever renders the consent prompt. Bindings are registered
//! per [`ConfirmUiMode`]; the set is open so embedders can add their own.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{ConfirmBehavior, ConfirmUiMode, Theme};
use crate::confirm::digest::TransactionSummary;
use crate::error::ConfirmError;

/// User decision reported by a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmEvent {
    /// `error` overrides the confirmation with a failure message.
    Confirm { error: Option<String> },
    Cancel { error: Option<String> },
}

/// Everything a surface renders.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmProps {
    pub title: String,
    pub account_id: String,
    pub summary: Vec<TransactionSummary>,
    pub theme: Theme,
    pub behavior: ConfirmBehavior,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_digest: Option<String>,
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Partial props for [`MountedSurface::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmPropsPatch {
    pub loading: Option<bool>,
    pub error_message: Option<String>,
    pub theme: Option<Theme>,
    pub title: Option<String>,
}

impl ConfirmProps {
    pub fn apply(&mut self, patch: ConfirmPropsPatch) {
        if let Some(loading) = patch.loading {
            self.loading = loading;
        }
        if patch.error_message.is_some() {
            self.error_message = patch.error_message;
        }
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(title) = patch.title {
            self.title = title;
        }
    }
}

/// A surface that is currently on screen.
pub trait MountedSurface: Send + Sync {
    fn update(&self, props: &ConfirmProps);
    fn unmount(&self);
}

/// Mounts surfaces of one kind.
pub trait ConfirmSurfaceFactory: Send + Sync {
    fn mount(
        &self,
        props: &ConfirmProps,
        events: mpsc::UnboundedSender<ConfirmEvent>,
    ) -> Box<dyn MountedSurface>;
}

/// Map from UI mode to the binding that renders it.
#[derive(Default, Clone)]
pub struct SurfaceRegistry {
    bindings: HashMap<ConfirmUiMode, Arc<dyn ConfirmSurfaceFactory>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mode: ConfirmUiMode, factory: Arc<dyn ConfirmSurfaceFactory>) {
        if self.bindings.insert(mode, factory).is_some() {
            tracing::debug!(mode = mode.as_str(), "Replaced confirmation surface binding");
        }
    }

    pub fn resolve(&self, mode: ConfirmUiMode) -> Result<Arc<dyn ConfirmSurfaceFactory>, ConfirmError> {
        self.bindings
            .get(&mode)
            .cloned()
            .ok_or_else(|| ConfirmError::UnknownSurface {
                kind: mode.as_str().to_string(),
            })
    }

    pub fn is_registered(&self, mode: ConfirmUiMode) -> bool {
        self.bindings.contains_key(&mode)
    }
}

impl std::fmt::Debug for SurfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modes: Vec<_> = self.bindings.keys().map(|m| m.as_str()).collect();
        f.debug_struct("SurfaceRegistry").field("modes", &modes).finish()
    }
}
