//! Confirmation gate.
//!
//! At most one surface is mounted at any time. Mounting supersedes, and
//! cancels, whatever was on screen before. A confirmation only counts if the
//! digest of the payload about to be signed equals the digest of what was
//! displayed.

pub mod digest;
pub mod surface;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfirmBehavior, ConfirmUiMode, ConfirmationConfig};
use crate::error::ConfirmError;
use crate::protocol::transaction::TransactionInput;

pub use digest::{TransactionSummary, compute_intent_digest, digests_match, summarize};
pub use surface::{
    ConfirmEvent, ConfirmProps, ConfirmPropsPatch, ConfirmSurfaceFactory, MountedSurface,
    SurfaceRegistry,
};

/// Lifecycle of one mounted surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    Loading,
    AwaitingDecision,
    Confirmed,
    Cancelled,
    Error,
}

impl ConfirmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled | Self::Error)
    }
}

/// What to put in front of the user.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub title: String,
    pub account_id: String,
    pub transactions: Vec<TransactionInput>,
    pub config: ConfirmationConfig,
}

struct Mounted {
    id: u64,
    surface: Option<Box<dyn MountedSurface>>,
    props: Mutex<ConfirmProps>,
    state: Mutex<ConfirmState>,
    cancelled: CancellationToken,
    unmounted: AtomicBool,
}

impl Mounted {
    fn unmount(&self) {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(surface) = &self.surface {
            surface.unmount();
        }
    }

    fn transition(&self, next: ConfirmState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    fn apply(&self, patch: ConfirmPropsPatch) {
        let props = {
            let mut props = self.props.lock();
            props.apply(patch);
            props.clone()
        };
        if !self.unmounted.load(Ordering::SeqCst)
            && let Some(surface) = &self.surface
        {
            surface.update(&props);
        }
    }
}

type ActiveSlot = Arc<Mutex<Option<Arc<Mounted>>>>;

/// Handle to the mounted surface.
pub struct ConfirmUiHandle {
    mounted: Arc<Mounted>,
    active: ActiveSlot,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConfirmEvent>>,
    expected_digest: Option<String>,
    behavior: ConfirmBehavior,
    auto_proceed_delay: Duration,
}

impl ConfirmUiHandle {
    /// Tear down the surface, recording the outcome.
    pub fn close(&self, confirmed: bool) {
        self.mounted.transition(if confirmed {
            ConfirmState::Confirmed
        } else {
            ConfirmState::Cancelled
        });
        self.mounted.unmount();
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|m| m.id == self.mounted.id) {
            active.take();
        }
    }

    pub fn update(&self, patch: ConfirmPropsPatch) {
        self.mounted.apply(patch);
    }

    pub fn state(&self) -> ConfirmState {
        *self.mounted.state.lock()
    }

    pub fn intent_digest(&self) -> Option<&str> {
        self.expected_digest.as_deref()
    }

    pub fn props(&self) -> ConfirmProps {
        self.mounted.props.lock().clone()
    }
}

impl Drop for ConfirmUiHandle {
    fn drop(&mut self) {
        self.close(false);
    }
}

/// Owns the single confirmation portal.
pub struct ConfirmUiController {
    registry: SurfaceRegistry,
    active: ActiveSlot,
    next_id: AtomicU64,
}

impl ConfirmUiController {
    pub fn new(registry: SurfaceRegistry) -> Self {
        Self {
            registry,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SurfaceRegistry {
        &self.registry
    }

    pub fn has_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Mount a surface for `request`, superseding any current one.
    pub fn mount_confirm_ui(&self, request: ConfirmRequest) -> Result<ConfirmUiHandle, ConfirmError> {
        let intent_digest = if request.transactions.is_empty() {
            None
        } else {
            Some(compute_intent_digest(&request.transactions).map_err(|e| {
                ConfirmError::Rejected {
                    message: Some(format!("transactions cannot be displayed: {e}")),
                }
            })?)
        };

        let factory = match request.config.ui_mode {
            ConfirmUiMode::Skip => None,
            mode => Some(self.registry.resolve(mode)?),
        };

        self.supersede_active();

        let props = ConfirmProps {
            title: request.title,
            account_id: request.account_id,
            summary: summarize(&request.transactions),
            theme: request.config.theme,
            behavior: request.config.behavior,
            intent_digest: intent_digest.clone(),
            loading: true,
            error_message: None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let surface = factory.map(|factory| factory.mount(&props, events_tx));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mounted = Arc::new(Mounted {
            id,
            surface,
            props: Mutex::new(props),
            state: Mutex::new(ConfirmState::Loading),
            cancelled: CancellationToken::new(),
            unmounted: AtomicBool::new(false),
        });
        *self.active.lock() = Some(Arc::clone(&mounted));
        tracing::debug!(surface_id = id, mode = request.config.ui_mode.as_str(), "Confirmation surface mounted");

        Ok(ConfirmUiHandle {
            mounted,
            active: Arc::clone(&self.active),
            events: tokio::sync::Mutex::new(events_rx),
            expected_digest: intent_digest,
            behavior: request.config.behavior,
            auto_proceed_delay: Duration::from_millis(request.config.auto_proceed_delay_ms),
        })
    }

    fn supersede_active(&self) {
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            tracing::debug!(surface_id = previous.id, "Superseding confirmation surface");
            previous.cancelled.cancel();
            previous.transition(ConfirmState::Cancelled);
            previous.unmount();
        }
    }

    /// Cancel and unmount whatever is on screen.
    pub fn cancel_active(&self) {
        self.supersede_active();
    }

    /// Wait for the user's decision on `handle`.
    ///
    /// `payload` is what will actually be signed. A confirmation is honoured
    /// only if its digest equals the one that was displayed.
    pub async fn await_confirm_ui_decision(
        &self,
        handle: &ConfirmUiHandle,
        payload: &[TransactionInput],
    ) -> Result<(), ConfirmError> {
        if !handle.mounted.transition(ConfirmState::AwaitingDecision) {
            return Err(ConfirmError::Superseded);
        }
        handle.update(ConfirmPropsPatch {
            loading: Some(false),
            ..Default::default()
        });

        let event = if handle.mounted.surface.is_none() {
            ConfirmEvent::Confirm { error: None }
        } else {
            let mut events = handle.events.lock().await;
            let auto = async {
                if handle.behavior == ConfirmBehavior::AutoProceed {
                    tokio::time::sleep(handle.auto_proceed_delay).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = handle.mounted.cancelled.cancelled() => {
                    handle.mounted.unmount();
                    return Err(ConfirmError::Superseded);
                }
                event = events.recv() => event.unwrap_or(ConfirmEvent::Cancel {
                    error: Some("confirmation surface closed".to_string()),
                }),
                _ = auto => ConfirmEvent::Confirm { error: None },
            }
        };

        let outcome = match event {
            ConfirmEvent::Cancel { error } | ConfirmEvent::Confirm { error: error @ Some(_) } => {
                Err(ConfirmError::Rejected { message: error })
            }
            ConfirmEvent::Confirm { error: None } => self.check_digest(handle, payload),
        };

        match &outcome {
            Ok(()) => {
                handle.mounted.transition(ConfirmState::Confirmed);
            }
            Err(e) => {
                handle.update(ConfirmPropsPatch {
                    error_message: Some(match e {
                        ConfirmError::Rejected { message: Some(m) } => m.clone(),
                        other => other.to_string(),
                    }),
                    ..Default::default()
                });
                handle.mounted.transition(ConfirmState::Cancelled);
            }
        }
        outcome
    }

    fn check_digest(
        &self,
        handle: &ConfirmUiHandle,
        payload: &[TransactionInput],
    ) -> Result<(), ConfirmError> {
        let Some(expected) = handle.expected_digest.as_deref() else {
            if payload.is_empty() {
                return Ok(());
            }
            return Err(ConfirmError::DigestMismatch {
                expected: String::new(),
                computed: compute_intent_digest(payload).unwrap_or_default(),
            });
        };
        let computed = compute_intent_digest(payload).map_err(|e| ConfirmError::Rejected {
            message: Some(format!("payload cannot be digested: {e}")),
        })?;
        if digests_match(expected, &computed) {
            Ok(())
        } else {
            tracing::warn!(
                surface_id = handle.mounted.id,
                "Intent digest mismatch between displayed and signed transactions"
            );
            Err(ConfirmError::DigestMismatch {
                expected: expected.to_string(),
                computed,
            })
        }
    }
}
