use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    challenge::{select_challenge, ChallengeKind, ChallengeProvider, ChallengeToken},
    diagnostics::{Diagnostics, LifecycleEvent},
    error::{Error, Result},
    keystore::AccountKey,
    protocol::{AcmeApi, AuthzStatus, OrderHandle, ProtocolClient},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    ChallengeSelected(ChallengeKind),
    Validating,
    Valid,
    Invalid(String),
    Expired,
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Pending => 0,
            SessionState::ChallengeSelected(_) => 1,
            SessionState::Validating => 2,
            SessionState::Valid | SessionState::Invalid(_) | SessionState::Expired => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Transitions only move forward; the one exception is staying pending.
    pub fn can_advance_to(&self, next: &SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
            || (*self == SessionState::Pending && *next == SessionState::Pending)
    }
}

/// Proof-of-control attempt for a single domain within one order.
pub struct AuthorizationSession<'a, A, P> {
    domain: String,
    state: SessionState,
    client: &'a ProtocolClient<A>,
    provider: &'a P,
    key: &'a AccountKey,
    order: &'a OrderHandle,
    diagnostics: &'a dyn Diagnostics,
    published: Option<ChallengeToken>,
}

impl<'a, A: AcmeApi, P: ChallengeProvider> AuthorizationSession<'a, A, P> {
    pub fn new(
        domain: impl Into<String>,
        client: &'a ProtocolClient<A>,
        provider: &'a P,
        key: &'a AccountKey,
        order: &'a OrderHandle,
        diagnostics: &'a dyn Diagnostics,
    ) -> Self {
        Self {
            domain: domain.into(),
            state: SessionState::Pending,
            client,
            provider,
            key,
            order,
            diagnostics,
            published: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Drive the session to a terminal state.
    ///
    /// Whatever happens, including cancellation, a published challenge is
    /// cleaned up before returning. Returns the terminal state on success.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<SessionState> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.drive() => result,
        };
        self.cleanup().await;
        match result {
            Ok(()) => Ok(self.state),
            Err(err) => {
                if !self.state.is_terminal() {
                    self.state = SessionState::Invalid(err.to_string());
                }
                debug!(domain = %self.domain, state = ?self.state, "authorization session ended");
                Err(err)
            }
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        debug!(domain = %self.domain, from = ?self.state, to = ?next, "authorization transition");
        self.state = next;
    }

    fn failed(&self, reason: impl Into<String>) -> Error {
        Error::AuthorizationFailed {
            domain: self.domain.clone(),
            reason: reason.into(),
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let authz = self
            .client
            .new_authorization(self.key, self.order, &self.domain)
            .await?;
        match authz.status {
            AuthzStatus::Valid => {
                info!(domain = %self.domain, "already authorized");
                self.advance(SessionState::Valid);
                return Ok(());
            }
            AuthzStatus::Invalid(reason) => {
                let reason = reason.unwrap_or_else(|| "authorization is invalid".into());
                self.advance(SessionState::Invalid(reason.clone()));
                return Err(self.failed(reason));
            }
            AuthzStatus::Expired => {
                self.advance(SessionState::Expired);
                return Err(self.failed("authorization expired"));
            }
            AuthzStatus::Pending | AuthzStatus::Processing => {}
        }

        let offered = authz.challenges.iter().map(|c| c.kind).collect::<Vec<_>>();
        let Some(kind) = select_challenge(&offered, &self.provider.supported()) else {
            let offered = offered.iter().map(|k| k.to_string()).collect();
            self.advance(SessionState::Invalid("no supported challenge".into()));
            return Err(Error::NoSupportedChallenge {
                domain: self.domain.clone(),
                offered,
            });
        };
        let Some(challenge) = authz.challenges.into_iter().find(|c| c.kind == kind) else {
            return Err(self.failed(format!("{kind} challenge disappeared")));
        };
        self.advance(SessionState::ChallengeSelected(kind));

        let token = ChallengeToken {
            kind,
            token: challenge.token.clone(),
            proof: challenge.proof.clone(),
        };
        self.published = Some(token.clone());
        debug!(domain = %self.domain, challenge = %kind, "publishing challenge");
        if let Err(err) = self.provider.publish(&self.domain, &token).await {
            let reason = format!("failed to publish {kind} challenge: {err:#}");
            self.advance(SessionState::Invalid(reason.clone()));
            return Err(self.failed(reason));
        }
        self.client
            .challenge_ready(self.key, self.order, &challenge.url)
            .await?;
        self.advance(SessionState::Validating);

        let poll = self.client.poll_policy();
        for tries in 1..=poll.max_attempts {
            sleep(poll.interval).await;
            let authz = self
                .client
                .poll_authorization(self.key, self.order, &self.domain)
                .await?;
            match authz.status {
                AuthzStatus::Valid => {
                    self.advance(SessionState::Valid);
                    self.diagnostics.event(LifecycleEvent::AuthorizationValid {
                        domain: self.domain.clone(),
                        challenge: kind,
                    });
                    return Ok(());
                }
                AuthzStatus::Invalid(reason) => {
                    let reason = reason.unwrap_or_else(|| "challenge rejected by CA".into());
                    self.advance(SessionState::Invalid(reason.clone()));
                    return Err(self.failed(reason));
                }
                AuthzStatus::Expired => {
                    self.advance(SessionState::Expired);
                    return Err(self.failed("authorization expired"));
                }
                AuthzStatus::Pending | AuthzStatus::Processing => {
                    debug!(domain = %self.domain, tries, "authorization still pending");
                }
            }
        }
        let reason = format!("not validated after {} polls", poll.max_attempts);
        self.advance(SessionState::Invalid(reason.clone()));
        Err(self.failed(reason))
    }

    async fn cleanup(&mut self) {
        let Some(token) = self.published.take() else {
            return;
        };
        debug!(domain = %self.domain, "cleaning up challenge");
        if let Err(err) = self.provider.cleanup(&self.domain, &token).await {
            warn!(domain = %self.domain, "failed to clean up challenge: {err:#}");
            self.diagnostics.event(LifecycleEvent::CleanupFailed {
                domain: self.domain.clone(),
                error: format!("{err:#}"),
            });
        }
    }
}
