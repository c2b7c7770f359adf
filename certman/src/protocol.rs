//! Request/response driver for the CA.
//!
//! [`AcmeApi`] is the raw transport seam: one method per CA endpoint, every
//! call signed with the account key. [`ProtocolClient`] wraps it with the
//! retry policy and the polling loops the lifecycle engine relies on.

use std::future::Future;

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    challenge::ChallengeKind,
    config::{PollPolicy, RetryPolicy},
    error::{Error, ProtocolError, Result},
    keystore::{AccountKey, CertKey},
};

/// Result of a successful account registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub account_uri: String,
    pub key: AccountKey,
}

/// A pending order on the CA side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub id: String,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedChallenge {
    pub kind: ChallengeKind,
    pub url: String,
    pub token: String,
    /// Value the provider must publish for this challenge.
    pub proof: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzStatus {
    Pending,
    Processing,
    Valid,
    Invalid(Option<String>),
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationState {
    pub domain: String,
    pub status: AuthzStatus,
    pub challenges: Vec<OfferedChallenge>,
    pub expires: Option<OffsetDateTime>,
}

/// CA endpoints.
#[allow(async_fn_in_trait)]
pub trait AcmeApi {
    async fn register(
        &self,
        contact: &[String],
        agree_tos: bool,
    ) -> Result<Registration, ProtocolError>;

    async fn new_order(
        &self,
        key: &AccountKey,
        domains: &[String],
    ) -> Result<OrderHandle, ProtocolError>;

    async fn new_authorization(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState, ProtocolError>;

    async fn poll_authorization(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState, ProtocolError>;

    async fn challenge_ready(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        challenge_url: &str,
    ) -> Result<(), ProtocolError>;

    async fn finalize_order(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        csr_der: &[u8],
    ) -> Result<(), ProtocolError>;

    /// `Ok(None)` while the CA is still processing the order.
    async fn poll_certificate(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
    ) -> Result<Option<String>, ProtocolError>;

    async fn revoke(&self, key: &AccountKey, cert_der: &[u8]) -> Result<(), ProtocolError>;
}

pub struct ProtocolClient<A> {
    api: A,
    retry: RetryPolicy,
    poll: PollPolicy,
}

impl<A: AcmeApi> ProtocolClient<A> {
    pub fn new(api: A, retry: RetryPolicy, poll: PollPolicy) -> Self {
        Self { api, retry, poll }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    pub async fn register(&self, contact: &[String], agree_tos: bool) -> Result<Registration> {
        let api = &self.api;
        self.with_retry("register", move || api.register(contact, agree_tos))
            .await
    }

    pub async fn new_order(&self, key: &AccountKey, domains: &[String]) -> Result<OrderHandle> {
        let api = &self.api;
        self.with_retry("new_order", move || api.new_order(key, domains))
            .await
    }

    pub async fn new_authorization(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState> {
        let api = &self.api;
        self.with_retry("new_authorization", move || {
            api.new_authorization(key, order, domain)
        })
        .await
    }

    pub async fn poll_authorization(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState> {
        let api = &self.api;
        self.with_retry("poll_authorization", move || {
            api.poll_authorization(key, order, domain)
        })
        .await
    }

    pub async fn challenge_ready(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        challenge_url: &str,
    ) -> Result<()> {
        let api = &self.api;
        self.with_retry("challenge_ready", move || {
            api.challenge_ready(key, order, challenge_url)
        })
        .await
    }

    /// Submit a CSR for the order's domains, signed by `cert_key`.
    pub async fn finalize_order(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        cert_key: &CertKey,
    ) -> Result<()> {
        let csr = make_csr(cert_key.pem(), &order.domains)?;
        let api = &self.api;
        let csr = &csr[..];
        self.with_retry("finalize_order", move || api.finalize_order(key, order, csr))
            .await
    }

    /// Wait for the issued chain, bounded by the poll policy.
    pub async fn poll_certificate(&self, key: &AccountKey, order: &OrderHandle) -> Result<String> {
        let api = &self.api;
        let mut tries = 0;
        loop {
            tries += 1;
            let chain = self
                .with_retry("poll_certificate", move || api.poll_certificate(key, order))
                .await?;
            if let Some(chain) = chain {
                return Ok(chain);
            }
            if tries >= self.poll.max_attempts {
                return Err(ProtocolError::fatal(
                    "timeout",
                    format!("certificate not ready after {tries} polls"),
                )
                .into());
            }
            debug!(tries, "certificate not ready, waiting {:?}", self.poll.interval);
            sleep(self.poll.interval).await;
        }
    }

    pub async fn revoke(&self, key: &AccountKey, cert_der: &[u8]) -> Result<()> {
        let api = &self.api;
        self.with_retry("revoke", move || api.revoke(key, cert_der))
            .await
    }

    /// Retry transient failures with exponential backoff; anything the CA
    /// rejects outright is returned on the first attempt.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let mut tries = 0u32;
        loop {
            tries += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable && tries < self.retry.max_attempts => {
                    let delay = self.retry.delay(tries);
                    warn!(op, tries, "transient failure: {err}, retrying in {delay:?}");
                    sleep(delay).await;
                }
                Err(err) => return Err(Error::Protocol(err)),
            }
        }
    }
}

/// Build a DER encoded CSR naming `names`, signed by `key`.
pub fn make_csr(key: &str, names: &[String]) -> Result<Vec<u8>> {
    let mut params =
        CertificateParams::new(names.to_vec()).context("failed to create certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    let key = KeyPair::from_pem(key).context("failed to parse private key")?;
    let csr = params
        .serialize_request(&key)
        .context("failed to serialize certificate request")?;
    Ok(csr.der().as_ref().to_vec())
}
