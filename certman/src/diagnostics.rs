//! Operator-facing lifecycle events.
//!
//! The orchestrator reports through a [`Diagnostics`] handle given to it at
//! construction instead of a process-wide logger.

use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::challenge::ChallengeKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    AccountRegistered { account_uri: String },
    AccountLoaded { account_uri: String },
    /// The one-time recovery token of a newly created account.
    RecoveryToken { token: String },
    AuthorizationValid { domain: String, challenge: ChallengeKind },
    CertificateIssued { bundle: String, domains: Vec<String> },
    CertificateSkipped { bundle: String, domains: Vec<String> },
    CheckpointCreated { sequence: u64 },
    CheckpointFailed { error: String },
    CleanupFailed { domain: String, error: String },
    Revoked { bundle: String },
    RolledBack { sequence: u64 },
}

pub trait Diagnostics {
    fn event(&self, event: LifecycleEvent);
}

/// Forwards lifecycle events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::AccountRegistered { account_uri } => {
                info!(account = %account_uri, "registered new account")
            }
            LifecycleEvent::AccountLoaded { account_uri } => {
                info!(account = %account_uri, "using existing account")
            }
            LifecycleEvent::RecoveryToken { token } => {
                warn!("account recovery token, store it somewhere safe, it will not be shown again: {token}")
            }
            LifecycleEvent::AuthorizationValid { domain, challenge } => {
                info!(%domain, %challenge, "domain authorized")
            }
            LifecycleEvent::CertificateIssued { bundle, domains } => {
                info!(%bundle, domains = %domains.join(","), "certificate issued")
            }
            LifecycleEvent::CertificateSkipped { bundle, domains } => {
                info!(%bundle, domains = %domains.join(","), "certificate is up to date")
            }
            LifecycleEvent::CheckpointCreated { sequence } => {
                info!(sequence, "checkpoint created")
            }
            LifecycleEvent::CheckpointFailed { error } => {
                error!("failed to create checkpoint: {error}")
            }
            LifecycleEvent::CleanupFailed { domain, error } => {
                warn!(%domain, "challenge cleanup failed: {error}")
            }
            LifecycleEvent::Revoked { bundle } => info!(%bundle, "certificate revoked"),
            LifecycleEvent::RolledBack { sequence } => {
                info!(sequence, "configuration rolled back")
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn event(&self, event: LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl<D: Diagnostics + ?Sized> Diagnostics for std::sync::Arc<D> {
    fn event(&self, event: LifecycleEvent) {
        (**self).event(event)
    }
}
