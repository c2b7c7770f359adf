//! [`AcmeApi`] backed by `instant-acme`.
//!
//! Orders are addressed by their URL, so no order state is kept between
//! calls. Accounts are rebuilt from the stored credentials once per key and
//! cached.

use std::{collections::HashMap, time::Duration};

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus, RevocationRequest,
};
use rustls_pki_types::CertificateDer;
use tokio::{sync::Mutex, time::sleep};
use tracing::debug;

use crate::{
    challenge::ChallengeKind,
    error::ProtocolError,
    keystore::AccountKey,
    protocol::{
        AcmeApi, AuthorizationState, AuthzStatus, OfferedChallenge, OrderHandle, Registration,
    },
};

/// Let's Encrypt production directory.
pub const LETSENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

pub struct AcmeClient {
    directory_url: String,
    accounts: Mutex<HashMap<String, Account>>,
}

impl AcmeClient {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn account(&self, key: &AccountKey) -> Result<Account, ProtocolError> {
        let fingerprint = key.fingerprint();
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.get(&fingerprint) {
            return Ok(account.clone());
        }
        let credentials: AccountCredentials = serde_json::from_str(key.material())
            .map_err(|e| ProtocolError::fatal("credentials", e.to_string()))?;
        let account = Account::from_credentials(credentials)
            .await
            .map_err(problem)?;
        accounts.insert(fingerprint, account.clone());
        Ok(account)
    }

    async fn order(&self, key: &AccountKey, order: &OrderHandle) -> Result<Order, ProtocolError> {
        self.account(key)
            .await?
            .order(order.id.clone())
            .await
            .map_err(problem)
    }

    async fn authorization(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState, ProtocolError> {
        let mut acme_order = self.order(key, order).await?;
        let authorizations = acme_order.authorizations().await.map_err(problem)?;
        let authz = authorizations
            .into_iter()
            .find(|authz| {
                let Identifier::Dns(identifier) = &authz.identifier;
                identifier.eq_ignore_ascii_case(domain)
            })
            .ok_or_else(|| {
                ProtocolError::fatal("malformed", format!("order has no authorization for {domain}"))
            })?;

        let challenges = authz
            .challenges
            .iter()
            .filter_map(|challenge| {
                let kind = challenge_kind(&challenge.r#type)?;
                let key_authorization = acme_order.key_authorization(challenge);
                let proof = match kind {
                    ChallengeKind::Dns01 => key_authorization.dns_value(),
                    ChallengeKind::Http01 | ChallengeKind::TlsAlpn01 => {
                        key_authorization.as_str().to_string()
                    }
                };
                Some(OfferedChallenge {
                    kind,
                    url: challenge.url.clone(),
                    token: challenge.token.clone(),
                    proof,
                })
            })
            .collect();
        let status = match authz.status {
            AuthorizationStatus::Pending => AuthzStatus::Pending,
            AuthorizationStatus::Valid => AuthzStatus::Valid,
            AuthorizationStatus::Expired => AuthzStatus::Expired,
            AuthorizationStatus::Invalid => AuthzStatus::Invalid(
                authz
                    .challenges
                    .iter()
                    .find_map(|c| c.error.as_ref())
                    .and_then(|e| e.detail.clone()),
            ),
            other => AuthzStatus::Invalid(Some(format!("authorization is {other:?}"))),
        };
        Ok(AuthorizationState {
            domain: domain.to_string(),
            status,
            challenges,
            expires: None,
        })
    }
}

impl AcmeApi for AcmeClient {
    async fn register(
        &self,
        contact: &[String],
        agree_tos: bool,
    ) -> Result<Registration, ProtocolError> {
        let contact = contact.iter().map(String::as_str).collect::<Vec<_>>();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: agree_tos,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(problem)?;
        let material = serde_json::to_string(&credentials)
            .map_err(|e| ProtocolError::fatal("credentials", e.to_string()))?;
        let key = AccountKey::new(material);
        self.accounts
            .lock()
            .await
            .insert(key.fingerprint(), account.clone());
        Ok(Registration {
            account_uri: account.id().to_string(),
            key,
        })
    }

    async fn new_order(
        &self,
        key: &AccountKey,
        domains: &[String],
    ) -> Result<OrderHandle, ProtocolError> {
        let identifiers = domains
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect::<Vec<_>>();
        let order = self
            .account(key)
            .await?
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(problem)?;
        debug!(order = order.url(), "created new order");
        Ok(OrderHandle {
            id: order.url().to_string(),
            domains: domains.to_vec(),
        })
    }

    async fn new_authorization(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState, ProtocolError> {
        self.authorization(key, order, domain).await
    }

    async fn poll_authorization(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        domain: &str,
    ) -> Result<AuthorizationState, ProtocolError> {
        self.authorization(key, order, domain).await
    }

    async fn challenge_ready(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        challenge_url: &str,
    ) -> Result<(), ProtocolError> {
        self.order(key, order)
            .await?
            .set_challenge_ready(challenge_url)
            .await
            .map_err(problem)
    }

    async fn finalize_order(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
        csr_der: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut acme_order = self.order(key, order).await?;
        // Authorizations turn valid before the order leaves `pending`.
        let mut tries = 0;
        loop {
            let state = acme_order.refresh().await.map_err(problem)?;
            if matches!(state.status, OrderStatus::Invalid) {
                return Err(ProtocolError::fatal("orderInvalid", "order is invalid"));
            }
            if !matches!(state.status, OrderStatus::Pending) || tries >= 5 {
                break;
            }
            tries += 1;
            debug!(tries, "order still pending, waiting");
            sleep(Duration::from_secs(1)).await;
        }
        acme_order.finalize(csr_der).await.map_err(problem)
    }

    async fn poll_certificate(
        &self,
        key: &AccountKey,
        order: &OrderHandle,
    ) -> Result<Option<String>, ProtocolError> {
        let mut acme_order = self.order(key, order).await?;
        let state = acme_order.refresh().await.map_err(problem)?;
        let (valid, invalid) = (
            matches!(state.status, OrderStatus::Valid),
            matches!(state.status, OrderStatus::Invalid),
        );
        if invalid {
            return Err(ProtocolError::fatal("orderInvalid", "order is invalid"));
        }
        if !valid {
            return Ok(None);
        }
        acme_order.certificate().await.map_err(problem)
    }

    async fn revoke(&self, key: &AccountKey, cert_der: &[u8]) -> Result<(), ProtocolError> {
        let certificate = CertificateDer::from(cert_der.to_vec());
        self.account(key)
            .await?
            .revoke(&RevocationRequest {
                certificate: &certificate,
                reason: None,
            })
            .await
            .map_err(problem)
    }
}

fn challenge_kind(r#type: &ChallengeType) -> Option<ChallengeKind> {
    match r#type {
        ChallengeType::Http01 => Some(ChallengeKind::Http01),
        ChallengeType::Dns01 => Some(ChallengeKind::Dns01),
        ChallengeType::TlsAlpn01 => Some(ChallengeKind::TlsAlpn01),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Problem documents keep the CA's classification; anything else happened
/// on the way to the CA and is worth retrying.
fn problem(err: instant_acme::Error) -> ProtocolError {
    match err {
        instant_acme::Error::Api(problem) => ProtocolError::from_problem(
            problem.r#type.as_deref(),
            problem.detail.as_deref(),
            problem.status,
        ),
        other => ProtocolError::transient("transport", other.to_string()),
    }
}
