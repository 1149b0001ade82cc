//! User-facing preferences with change notification.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::{ConfirmBehavior, ConfirmationConfig, Theme};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub confirm_behavior: ConfirmBehavior,
    pub theme: Theme,
}

impl Preferences {
    /// Overlay onto the configured confirmation settings.
    pub fn apply_to(&self, mut config: ConfirmationConfig) -> ConfirmationConfig {
        config.behavior = self.confirm_behavior;
        config.theme = self.theme;
        config
    }
}

/// Current preferences. Subscribers see every effective change.
pub struct PreferenceStore {
    tx: watch::Sender<Preferences>,
}

impl PreferenceStore {
    pub fn new(initial: Preferences) -> Self {
        Self {
            tx: watch::Sender::new(initial),
        }
    }

    pub fn get(&self) -> Preferences {
        *self.tx.borrow()
    }

    /// Returns whether anything changed.
    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) -> bool {
        self.tx.send_if_modified(|prefs| {
            let changed = prefs.confirm_behavior != behavior;
            prefs.confirm_behavior = behavior;
            changed
        })
    }

    pub fn set_theme(&self, theme: Theme) -> bool {
        self.tx.send_if_modified(|prefs| {
            let changed = prefs.theme != theme;
            prefs.theme = theme;
            changed
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Preferences> {
        self.tx.subscribe()
    }
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::new(Preferences::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let store = PreferenceStore::default();
        let mut rx = store.subscribe();

        assert!(!store.set_theme(Theme::Dark));
        assert!(!rx.has_changed().unwrap());

        assert!(store.set_theme(Theme::Light));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().theme, Theme::Light);
    }

    #[test]
    fn preferences_override_config() {
        let prefs = Preferences {
            confirm_behavior: ConfirmBehavior::AutoProceed,
            theme: Theme::Light,
        };
        let config = prefs.apply_to(ConfirmationConfig::default());
        assert_eq!(config.behavior, ConfirmBehavior::AutoProceed);
        assert_eq!(config.theme, Theme::Light);
    }
}
