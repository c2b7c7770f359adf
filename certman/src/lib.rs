//! Account and certificate lifecycle engine for ACME-style CAs.
//!
//! `certman` keeps one configuration directory per deployment: the CA
//! account, a vault of issued certificate bundles and a history of
//! checkpoints that can be rolled back to.
//!
//! # Features
//!
//! - Idempotent account registration
//! - Per-domain authorization with pluggable challenge providers
//! - Atomic certificate storage with integrity checks
//! - Revocation that keeps local and CA state in step
//! - Checkpoints with rollback by count or by sequence number
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use certman::{
//!     AcmeClient, ChallengeBackend, LifecycleConfig, LifecycleOrchestrator,
//!     TracingDiagnostics,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LifecycleConfig::builder()
//!         .workdir("/var/lib/certman")
//!         .acme_url(certman::LETSENCRYPT_DIRECTORY)
//!         .build();
//!     let engine = LifecycleOrchestrator::new(
//!         config,
//!         AcmeClient::new(certman::LETSENCRYPT_DIRECTORY),
//!         ChallengeBackend::webroot("/var/www/html"),
//!         Arc::new(TracingDiagnostics),
//!         CancellationToken::new(),
//!     )?;
//!     let domains = vec!["example.com".to_string(), "www.example.com".to_string()];
//!     let summary = engine.run(&domains, "ops@example.com").await?;
//!     println!("certificate bundle: {}", summary.bundle);
//!     Ok(())
//! }
//! ```

pub use account::{Account, AccountStatus, AccountStore, EnsuredAccount, RecoveryToken};
pub use acme_client::{AcmeClient, LETSENCRYPT_DIRECTORY};
pub use authz::{AuthorizationSession, SessionState};
pub use challenge::{
    select_challenge, ChallengeBackend, ChallengeKind, ChallengeProvider, ChallengeToken,
    HookProvider, WebrootProvider,
};
pub use checkpoint::{CheckpointManifest, CheckpointStore};
pub use config::{LifecycleConfig, PollPolicy, RetryPolicy};
pub use diagnostics::{Diagnostics, LifecycleEvent, RecordingDiagnostics, TracingDiagnostics};
pub use error::{Error, ProtocolError, Result};
pub use keystore::{AccountKey, CertKey, KeyStore};
pub use orchestrator::{
    CertificateRef, LifecycleOrchestrator, Operation, Outcome, RevokeSummary, RunSummary,
};
pub use protocol::{
    make_csr, AcmeApi, AuthorizationState, AuthzStatus, OfferedChallenge, OrderHandle,
    ProtocolClient, Registration,
};
pub use vault::{
    normalize_domains, BundleMeta, CertificateVault, IssuedCertificate, RevokeOutcome, Revocation,
    StoredBundle,
};
pub use workdir::WorkDir;

mod account;
mod acme_client;
mod authz;
mod challenge;
mod checkpoint;
mod config;
mod diagnostics;
mod error;
mod keystore;
mod orchestrator;
mod protocol;
mod vault;
mod workdir;

#[cfg(test)]
pub(crate) mod test_utils;
