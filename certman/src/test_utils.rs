//! In-memory CA and challenge provider for tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, IsCa,
    KeyPair, SerialNumber,
};
use rustls_pki_types::CertificateSigningRequestDer;
use time::OffsetDateTime;

use crate::{
    challenge::{ChallengeKind, ChallengeProvider, ChallengeToken},
    error::ProtocolError,
    keystore::AccountKey,
    protocol::{
        AcmeApi, AuthorizationState, AuthzStatus, OfferedChallenge, OrderHandle, Registration,
    },
};

/// How the fake CA judges a domain once its challenge is marked ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzOutcome {
    Valid,
    Invalid,
    Expired,
    /// Stays `processing` forever.
    Stuck,
    /// Already valid before any challenge is attempted.
    Preauthorized,
}

struct FakeOrder {
    domains: Vec<String>,
    ready: BTreeSet<String>,
    chain: Option<String>,
}

#[derive(Default)]
struct State {
    calls: BTreeMap<&'static str, usize>,
    transient: BTreeMap<&'static str, usize>,
    rejected: BTreeMap<&'static str, String>,
    outcomes: BTreeMap<String, AuthzOutcome>,
    orders: BTreeMap<String, FakeOrder>,
    accounts: usize,
    next_serial: u64,
    revoked: Vec<Vec<u8>>,
}

struct Issuer {
    cert: Certificate,
    key: KeyPair,
}

#[derive(Clone)]
pub struct FakeCa {
    state: Arc<Mutex<State>>,
    issuer: Arc<Issuer>,
    offered: Vec<ChallengeKind>,
    validity: Duration,
}

impl FakeCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Self {
            state: Default::default(),
            issuer: Arc::new(Issuer { cert, key }),
            offered: vec![ChallengeKind::Dns01, ChallengeKind::Http01],
            validity: Duration::from_secs(90 * 24 * 3600),
        }
    }

    pub fn offering(mut self, kinds: &[ChallengeKind]) -> Self {
        self.offered = kinds.to_vec();
        self
    }

    pub fn issuing_for(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn set_outcome(&self, domain: &str, outcome: AuthzOutcome) {
        self.state()
            .outcomes
            .insert(domain.to_string(), outcome);
    }

    /// The next `times` calls of `op` fail with a retryable error.
    pub fn fail_transiently(&self, op: &'static str, times: usize) {
        self.state().transient.insert(op, times);
    }

    /// Every call of `op` is rejected with the given problem type.
    pub fn reject(&self, op: &'static str, code: &str) {
        self.state().rejected.insert(op, code.to_string());
    }

    pub fn accept(&self, op: &'static str) {
        self.state().rejected.remove(op);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    pub fn accounts(&self) -> usize {
        self.state().accounts
    }

    pub fn revoked(&self) -> usize {
        self.state().revoked.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn enter(&self, op: &'static str) -> Result<(), ProtocolError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(code) = state.rejected.get(op) {
            return Err(ProtocolError::fatal(code.clone(), format!("{op} rejected")));
        }
        if let Some(left) = state.transient.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(ProtocolError::transient("http-503", "service unavailable"));
            }
        }
        Ok(())
    }

    fn authz(&self, order: &OrderHandle, domain: &str) -> Result<AuthorizationState, ProtocolError> {
        let state = self.state();
        let fake = state
            .orders
            .get(&order.id)
            .ok_or_else(|| ProtocolError::fatal("malformed", "no such order"))?;
        if !fake.domains.iter().any(|d| d == domain) {
            return Err(ProtocolError::fatal("malformed", "domain not in order"));
        }
        let outcome = state
            .outcomes
            .get(domain)
            .copied()
            .unwrap_or(AuthzOutcome::Valid);
        let status = if outcome == AuthzOutcome::Preauthorized {
            AuthzStatus::Valid
        } else if !fake.ready.contains(domain) {
            AuthzStatus::Pending
        } else {
            match outcome {
                AuthzOutcome::Valid | AuthzOutcome::Preauthorized => AuthzStatus::Valid,
                AuthzOutcome::Invalid => AuthzStatus::Invalid(Some("challenge rejected".into())),
                AuthzOutcome::Expired => AuthzStatus::Expired,
                AuthzOutcome::Stuck => AuthzStatus::Processing,
            }
        };
        let challenges = self
            .offered
            .iter()
            .map(|kind| {
                let token = format!("tok-{}-{}", domain.replace('.', "-"), kind);
                OfferedChallenge {
                    kind: *kind,
                    url: format!("https://ca.test/chall/{}/{domain}/{kind}", order.id),
                    proof: format!("{token}.thumbprint"),
                    token,
                }
            })
            .collect();
        Ok(AuthorizationState {
            domain: domain.to_string(),
            status,
            challenges,
            expires: Some(OffsetDateTime::now_utc() + time::Duration::days(7)),
        })
    }

    fn sign(&self, csr_der: &[u8], serial: u64) -> Result<String, ProtocolError> {
        let bad_csr = |e: rcgen::Error| ProtocolError::fatal("badCSR", e.to_string());
        let csr = CertificateSigningRequestDer::from(csr_der.to_vec());
        let mut csr = CertificateSigningRequestParams::from_der(&csr).map_err(bad_csr)?;
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::hours(1);
        csr.params.not_after = now + self.validity;
        csr.params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
        let leaf = csr
            .signed_by(&self.issuer.cert, &self.issuer.key)
            .map_err(bad_csr)?;
        Ok(format!("{}{}", leaf.pem(), self.issuer.cert.pem()))
    }
}

impl AcmeApi for FakeCa {
    async fn register(
        &self,
        _contact: &[String],
        agree_tos: bool,
    ) -> Result<Registration, ProtocolError> {
        self.enter("register")?;
        if !agree_tos {
            return Err(ProtocolError::fatal(
                "urn:ietf:params:acme:error:userActionRequired",
                "terms of service not agreed",
            ));
        }
        let mut state = self.state();
        state.accounts += 1;
        let uri = format!("https://ca.test/acct/{}", state.accounts);
        Ok(Registration {
            key: AccountKey::new(format!(r#"{{"id":"{uri}","key":"{}"}}"#, uuid::Uuid::new_v4())),
            account_uri: uri,
        })
    }

    async fn new_order(
        &self,
        _key: &AccountKey,
        domains: &[String],
    ) -> Result<OrderHandle, ProtocolError> {
        self.enter("new_order")?;
        let id = uuid::Uuid::new_v4().to_string();
        self.state().orders.insert(
            id.clone(),
            FakeOrder {
                domains: domains.to_vec(),
                ready: BTreeSet::new(),
                chain: None,
            },
        );
        Ok(OrderHandle {
            id,
            domains: domains.to_vec(),
        })
    }

    async fn new_authorization(
        &self,
        _key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState, ProtocolError> {
        self.enter("new_authorization")?;
        self.authz(order, domain)
    }

    async fn poll_authorization(
        &self,
        _key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState, ProtocolError> {
        self.enter("poll_authorization")?;
        self.authz(order, domain)
    }

    async fn challenge_ready(
        &self,
        _key: &AccountKey,
        order: &OrderHandle,
        challenge_url: &str,
    ) -> Result<(), ProtocolError> {
        self.enter("challenge_ready")?;
        let mut state = self.state();
        let fake = state
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| ProtocolError::fatal("malformed", "no such order"))?;
        let domain = fake
            .domains
            .iter()
            .find(|d| challenge_url.contains(&format!("/{d}/")))
            .cloned()
            .ok_or_else(|| ProtocolError::fatal("malformed", "unknown challenge"))?;
        fake.ready.insert(domain);
        Ok(())
    }

    async fn finalize_order(
        &self,
        _key: &AccountKey,
        order: &OrderHandle,
        csr_der: &[u8],
    ) -> Result<(), ProtocolError> {
        self.enter("finalize_order")?;
        let serial = {
            let mut state = self.state();
            state.next_serial += 1;
            state.next_serial
        };
        let chain = self.sign(csr_der, serial)?;
        let mut state = self.state();
        let fake = state
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| ProtocolError::fatal("malformed", "no such order"))?;
        fake.chain = Some(chain);
        Ok(())
    }

    async fn poll_certificate(
        &self,
        _key: &AccountKey,
        order: &OrderHandle,
    ) -> Result<Option<String>, ProtocolError> {
        self.enter("poll_certificate")?;
        let state = self.state();
        let fake = state
            .orders
            .get(&order.id)
            .ok_or_else(|| ProtocolError::fatal("malformed", "no such order"))?;
        Ok(fake.chain.clone())
    }

    async fn revoke(&self, _key: &AccountKey, cert_der: &[u8]) -> Result<(), ProtocolError> {
        self.enter("revoke")?;
        let mut state = self.state();
        if state.revoked.iter().any(|der| der == cert_der) {
            return Err(ProtocolError::fatal(
                "urn:ietf:params:acme:error:alreadyRevoked",
                "certificate already revoked",
            ));
        }
        state.revoked.push(cert_der.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct ProviderLog {
    published: Vec<(String, ChallengeToken)>,
    cleaned: Vec<(String, ChallengeToken)>,
    /// Challenges published and not yet cleaned up.
    in_flight: usize,
    peak_in_flight: usize,
}

/// Challenge provider that only records what it was asked to do.
#[derive(Clone)]
pub struct FakeProvider {
    supported: Vec<ChallengeKind>,
    fail_cleanup: bool,
    publish_delay: Duration,
    log: Arc<Mutex<ProviderLog>>,
}

impl FakeProvider {
    pub fn new(supported: &[ChallengeKind]) -> Self {
        Self {
            supported: supported.to_vec(),
            fail_cleanup: false,
            publish_delay: Duration::ZERO,
            log: Default::default(),
        }
    }

    pub fn failing_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    /// Every publish takes `delay` before returning.
    pub fn slow_publish(mut self, delay: Duration) -> Self {
        self.publish_delay = delay;
        self
    }

    /// Most challenges that were live at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.log.lock().unwrap().peak_in_flight
    }

    pub fn published(&self) -> Vec<(String, ChallengeToken)> {
        self.log.lock().unwrap().published.clone()
    }

    pub fn cleaned(&self) -> Vec<(String, ChallengeToken)> {
        self.log.lock().unwrap().cleaned.clone()
    }
}

impl ChallengeProvider for FakeProvider {
    fn supported(&self) -> Vec<ChallengeKind> {
        self.supported.clone()
    }

    async fn publish(&self, domain: &str, token: &ChallengeToken) -> anyhow::Result<()> {
        {
            let mut log = self.log.lock().unwrap();
            log.published.push((domain.to_string(), token.clone()));
            log.in_flight += 1;
            log.peak_in_flight = log.peak_in_flight.max(log.in_flight);
        }
        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }
        Ok(())
    }

    async fn cleanup(&self, domain: &str, token: &ChallengeToken) -> anyhow::Result<()> {
        {
            let mut log = self.log.lock().unwrap();
            log.cleaned.push((domain.to_string(), token.clone()));
            log.in_flight = log.in_flight.saturating_sub(1);
        }
        if self.fail_cleanup {
            anyhow::bail!("cleanup exploded");
        }
        Ok(())
    }
}

pub fn domains(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
