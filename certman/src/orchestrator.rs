use std::{future::Future, path::PathBuf, sync::Arc};

use anyhow::anyhow;
use futures::{stream, StreamExt};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    account::{AccountStore, RecoveryToken},
    authz::AuthorizationSession,
    challenge::ChallengeProvider,
    checkpoint::CheckpointStore,
    config::LifecycleConfig,
    diagnostics::{Diagnostics, LifecycleEvent},
    error::{Error, Result},
    keystore::{AccountKey, KeyStore},
    protocol::{AcmeApi, OrderHandle, ProtocolClient},
    vault::{normalize_domains, CertificateVault, IssuedCertificate, RevokeOutcome, StoredBundle},
};

/// Which certificates a revocation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateRef {
    /// One bundle by its vault id.
    Bundle(String),
    /// The newest active bundle for exactly this domain set.
    Domains(Vec<String>),
    /// Every active bundle issued for the private key at this path.
    Key(PathBuf),
}

#[derive(Debug, Clone)]
pub enum Operation {
    Run {
        domains: Vec<String>,
        contact_email: String,
        force: bool,
    },
    Auth,
    Install,
    Revoke {
        certificate: CertificateRef,
        reason: Option<String>,
    },
    Rollback(usize),
    Restore(u64),
}

#[derive(Debug)]
pub enum Outcome {
    Run(RunSummary),
    Revoked(RevokeSummary),
    RolledBack(u64),
}

#[derive(Debug)]
pub struct RunSummary {
    pub account_uri: String,
    pub bundle: String,
    pub domains: Vec<String>,
    /// False when the existing bundle was still fresh and nothing was issued.
    pub renewed: bool,
    /// `None` when nothing changed or the checkpoint could not be written.
    pub checkpoint: Option<u64>,
    /// Only on the run that created the account.
    pub recovery_token: Option<RecoveryToken>,
}

#[derive(Debug)]
pub struct RevokeSummary {
    /// Bundles revoked by this call.
    pub bundles: Vec<String>,
    /// Bundles that were already revoked and left as they were.
    pub already_revoked: Vec<String>,
    /// `None` when nothing changed or the checkpoint could not be written.
    pub checkpoint: Option<u64>,
}

pub struct LifecycleOrchestrator<A, P> {
    config: LifecycleConfig,
    client: ProtocolClient<A>,
    provider: P,
    keystore: KeyStore,
    accounts: AccountStore,
    vault: CertificateVault,
    checkpoints: CheckpointStore,
    diagnostics: Arc<dyn Diagnostics + Send + Sync>,
    cancel: CancellationToken,
}

impl<A: AcmeApi, P: ChallengeProvider> LifecycleOrchestrator<A, P> {
    pub fn new(
        config: LifecycleConfig,
        api: A,
        provider: P,
        diagnostics: Arc<dyn Diagnostics + Send + Sync>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let workdir = config.workdir();
        let keystore = KeyStore::new();
        Ok(Self {
            client: ProtocolClient::new(api, config.retry(), config.poll()),
            provider,
            accounts: AccountStore::new(workdir.clone(), keystore.clone()),
            vault: CertificateVault::open(workdir.clone())?,
            checkpoints: CheckpointStore::open(workdir)?,
            keystore,
            diagnostics,
            cancel,
            config,
        })
    }

    pub fn client(&self) -> &ProtocolClient<A> {
        &self.client
    }

    pub fn vault(&self) -> &CertificateVault {
        &self.vault
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub async fn execute(&self, operation: Operation) -> Result<Outcome> {
        match operation {
            Operation::Run {
                domains,
                contact_email,
                force,
            } => {
                let summary = if force {
                    self.run_forced(&domains, &contact_email).await?
                } else {
                    self.run(&domains, &contact_email).await?
                };
                Ok(Outcome::Run(summary))
            }
            Operation::Auth => Err(Error::NotImplemented("auth")),
            Operation::Install => Err(Error::NotImplemented("install")),
            Operation::Revoke {
                certificate,
                reason,
            } => Ok(Outcome::Revoked(self.revoke(&certificate, reason).await?)),
            Operation::Rollback(steps) => Ok(Outcome::RolledBack(self.rollback(steps)?)),
            Operation::Restore(sequence) => {
                self.restore(sequence)?;
                Ok(Outcome::RolledBack(sequence))
            }
        }
    }

    /// Issue a certificate for `domains`, unless a fresh one already exists.
    pub async fn run(&self, domains: &[String], contact_email: &str) -> Result<RunSummary> {
        self.issue(domains, contact_email, false).await
    }

    /// Issue a certificate for `domains` regardless of the existing one.
    pub async fn run_forced(&self, domains: &[String], contact_email: &str) -> Result<RunSummary> {
        self.issue(domains, contact_email, true).await
    }

    async fn issue(&self, domains: &[String], contact_email: &str, force: bool) -> Result<RunSummary> {
        let domains = normalize_domains(domains);
        if domains.is_empty() {
            return Err(anyhow!("no domains requested").into());
        }
        self.check_cancelled()?;

        let ensured = self
            .cancellable(self.accounts.ensure_registered(
                &self.client,
                contact_email,
                self.config.agree_tos(),
            ))
            .await?;
        let account = ensured.account;
        match &ensured.recovery_token {
            Some(token) => {
                self.diagnostics.event(LifecycleEvent::AccountRegistered {
                    account_uri: account.account_uri.clone(),
                });
                self.diagnostics.event(LifecycleEvent::RecoveryToken {
                    token: token.expose().to_string(),
                });
            }
            None => self.diagnostics.event(LifecycleEvent::AccountLoaded {
                account_uri: account.account_uri.clone(),
            }),
        }

        if !force {
            if let Some(current) = self.vault.lookup(&domains)? {
                if !current.expires_within(OffsetDateTime::now_utc(), self.config.renew_before()) {
                    debug!(bundle = %current.id, not_after = %current.meta.not_after, "no renewal needed");
                    self.diagnostics.event(LifecycleEvent::CertificateSkipped {
                        bundle: current.id.clone(),
                        domains: domains.clone(),
                    });
                    return Ok(RunSummary {
                        account_uri: account.account_uri,
                        bundle: current.id,
                        domains,
                        renewed: false,
                        checkpoint: None,
                        recovery_token: ensured.recovery_token,
                    });
                }
                info!(bundle = %current.id, "certificate expires soon, renewing");
            }
        }

        let key = account.key();
        let order = self
            .cancellable(self.client.new_order(key, &domains))
            .await?;
        self.authorize_all(key, &order).await?;

        let cert_key = self.keystore.generate_cert_key()?;
        self.cancellable(self.client.finalize_order(key, &order, &cert_key))
            .await?;
        let chain_pem = self
            .cancellable(self.client.poll_certificate(key, &order))
            .await?;
        self.check_cancelled()?;

        let bundle = self.vault.store(IssuedCertificate {
            domains: domains.clone(),
            chain_pem,
            key: cert_key,
        })?;
        self.diagnostics.event(LifecycleEvent::CertificateIssued {
            bundle: bundle.id.clone(),
            domains: bundle.meta.domains.clone(),
        });
        if let Err(err) = self.vault.link_live(&bundle) {
            warn!(bundle = %bundle.id, "failed to update live links: {err}");
        }

        let checkpoint = self.checkpoint();
        Ok(RunSummary {
            account_uri: account.account_uri,
            bundle: bundle.id,
            domains,
            renewed: true,
            checkpoint,
            recovery_token: ensured.recovery_token,
        })
    }

    /// Authorize every domain of the order, a bounded number at a time.
    ///
    /// The first failing session cancels the rest of the batch. Every session
    /// is driven to completion so its challenge gets cleaned up.
    async fn authorize_all(&self, key: &AccountKey, order: &OrderHandle) -> Result<()> {
        let batch = self.cancel.child_token();
        let diagnostics: &dyn Diagnostics = &*self.diagnostics;
        let sessions = stream::iter(order.domains.iter()).map(|domain| {
            let batch = &batch;
            async move {
                let result = AuthorizationSession::new(
                    domain.as_str(),
                    &self.client,
                    &self.provider,
                    key,
                    order,
                    diagnostics,
                )
                .run(batch)
                .await;
                if result.is_err() {
                    batch.cancel();
                }
                result
            }
        });
        let mut sessions = sessions.buffer_unordered(self.config.max_concurrent_authorizations());

        let mut failure: Option<Error> = None;
        while let Some(result) = sessions.next().await {
            let Err(err) = result else {
                continue;
            };
            // Keep the error that started the cancellation, not the ones it caused.
            let replace = match &failure {
                None => true,
                Some(Error::Cancelled) => !matches!(err, Error::Cancelled),
                Some(_) => false,
            };
            if replace {
                failure = Some(err);
            }
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Revoke the referenced certificates locally and with the CA.
    pub async fn revoke(
        &self,
        certificate: &CertificateRef,
        reason: Option<String>,
    ) -> Result<RevokeSummary> {
        let account = self
            .accounts
            .load()?
            .ok_or_else(|| Error::Registration("no account registered".into()))?;
        let targets = self.resolve(certificate)?;

        let mut revoked = vec![];
        let mut already_revoked = vec![];
        for bundle in targets {
            if let Err(err) = self.check_cancelled() {
                self.checkpoint_if_changed(&revoked);
                return Err(err);
            }
            match self
                .vault
                .revoke(&bundle.id, &self.client, account.key(), reason.clone())
                .await
            {
                Ok(RevokeOutcome::Revoked(_)) => {
                    self.diagnostics.event(LifecycleEvent::Revoked {
                        bundle: bundle.id.clone(),
                    });
                    revoked.push(bundle.id);
                }
                Ok(RevokeOutcome::AlreadyRevoked(_)) => already_revoked.push(bundle.id),
                Err(err) => {
                    self.checkpoint_if_changed(&revoked);
                    return Err(err);
                }
            }
        }
        let checkpoint = self.checkpoint_if_changed(&revoked);
        Ok(RevokeSummary {
            bundles: revoked,
            already_revoked,
            checkpoint,
        })
    }

    fn resolve(&self, certificate: &CertificateRef) -> Result<Vec<StoredBundle>> {
        match certificate {
            CertificateRef::Bundle(id) => Ok(vec![self.vault.get(id)?]),
            CertificateRef::Domains(domains) => {
                let bundle = self
                    .vault
                    .lookup(domains)?
                    .ok_or_else(|| Error::BundleNotFound(domains.join(",")))?;
                Ok(vec![bundle])
            }
            CertificateRef::Key(path) => {
                let key = self.keystore.load_cert_key(path)?;
                let bundles = self.vault.find_by_key(&key)?;
                if bundles.is_empty() {
                    return Err(Error::BundleNotFound(path.display().to_string()));
                }
                Ok(bundles)
            }
        }
    }

    /// Restore the checkpoint `steps` positions before the newest one.
    pub fn rollback(&self, steps: usize) -> Result<u64> {
        let sequence = self.checkpoints.rollback(steps)?;
        self.after_restore(sequence);
        Ok(sequence)
    }

    /// Restore checkpoint `sequence`.
    pub fn restore(&self, sequence: u64) -> Result<()> {
        self.checkpoints.restore(sequence)?;
        self.after_restore(sequence);
        Ok(())
    }

    fn after_restore(&self, sequence: u64) {
        self.diagnostics
            .event(LifecycleEvent::RolledBack { sequence });
        if let Err(err) = self.relink_live() {
            warn!("failed to refresh live links after restore: {err}");
        }
    }

    /// Point each live directory at the newest active bundle for its domain.
    fn relink_live(&self) -> Result<()> {
        // Oldest first, so the newest bundle wins.
        for bundle in self.vault.list()? {
            if !bundle.is_revoked() {
                self.vault.link_live(&bundle)?;
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Option<u64> {
        match self.checkpoints.snapshot() {
            Ok(sequence) => {
                self.diagnostics
                    .event(LifecycleEvent::CheckpointCreated { sequence });
                if let Some(keep) = self.config.checkpoint_retention() {
                    if let Err(err) = self.checkpoints.prune(keep.max(1)) {
                        warn!("failed to prune checkpoints: {err}");
                    }
                }
                Some(sequence)
            }
            Err(err) => {
                self.diagnostics.event(LifecycleEvent::CheckpointFailed {
                    error: err.to_string(),
                });
                None
            }
        }
    }

    fn checkpoint_if_changed(&self, revoked: &[String]) -> Option<u64> {
        if revoked.is_empty() {
            return None;
        }
        self.checkpoint()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }
}
