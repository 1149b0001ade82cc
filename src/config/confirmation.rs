use serde::{Deserialize, Serialize};

use crate::config::helpers::normalize_variant;
use crate::error::ConfigError;

/// Whether the confirmation surface waits for an explicit click.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConfirmBehavior {
    #[default]
    RequireClick,
    AutoProceed,
}

impl ConfirmBehavior {
    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "require_click" | "requireclick" => Ok(Self::RequireClick),
            "auto_proceed" | "autoproceed" => Ok(Self::AutoProceed),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'requireClick' or 'autoProceed', got '{value}'"),
            }),
        }
    }
}

/// Which confirmation surface binding is mounted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConfirmUiMode {
    #[default]
    Modal,
    Drawer,
    Skip,
}

impl ConfirmUiMode {
    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "modal" => Ok(Self::Modal),
            "drawer" => Ok(Self::Drawer),
            "skip" => Ok(Self::Skip),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'modal', 'drawer', or 'skip', got '{value}'"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Modal => "modal",
            Self::Drawer => "drawer",
            Self::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "dark" => Ok(Self::Dark),
            "light" => Ok(Self::Light),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'dark' or 'light', got '{value}'"),
            }),
        }
    }
}

/// Resolved confirmation settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationConfig {
    pub behavior: ConfirmBehavior,
    pub ui_mode: ConfirmUiMode,
    pub auto_proceed_delay_ms: u64,
    pub theme: Theme,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            behavior: ConfirmBehavior::RequireClick,
            ui_mode: ConfirmUiMode::Modal,
            auto_proceed_delay_ms: 0,
            theme: Theme::Dark,
        }
    }
}

/// Partial confirmation settings as sent over the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<ConfirmBehavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_mode: Option<ConfirmUiMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_proceed_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
}

impl ConfirmationPatch {
    pub fn merge(&mut self, other: ConfirmationPatch) {
        if other.behavior.is_some() {
            self.behavior = other.behavior;
        }
        if other.ui_mode.is_some() {
            self.ui_mode = other.ui_mode;
        }
        if other.auto_proceed_delay_ms.is_some() {
            self.auto_proceed_delay_ms = other.auto_proceed_delay_ms;
        }
        if other.theme.is_some() {
            self.theme = other.theme;
        }
    }

    pub fn resolve(&self) -> ConfirmationConfig {
        let defaults = ConfirmationConfig::default();
        ConfirmationConfig {
            behavior: self.behavior.unwrap_or(defaults.behavior),
            ui_mode: self.ui_mode.unwrap_or(defaults.ui_mode),
            auto_proceed_delay_ms: self
                .auto_proceed_delay_ms
                .unwrap_or(defaults.auto_proceed_delay_ms),
            theme: self.theme.unwrap_or(defaults.theme),
        }
    }
}
