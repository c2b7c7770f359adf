use anyhow::Context;
use fs_err as fs;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    keystore::{sha256_hex, write_private, AccountKey, KeyStore},
    protocol::{AcmeApi, ProtocolClient},
    workdir::WorkDir,
};

const REGISTRATION_FILE: &str = "registration.json";
const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
}

/// What is persisted next to the key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RegistrationRecord {
    account_uri: String,
    contact: Vec<String>,
    status: AccountStatus,
    key_fingerprint: String,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    recovery_token_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub account_uri: String,
    pub contact: Vec<String>,
    pub status: AccountStatus,
    pub created_at: OffsetDateTime,
    key: AccountKey,
}

impl Account {
    pub fn key(&self) -> &AccountKey {
        &self.key
    }
}

/// Shown to the operator once, right after the account is created.
///
/// Only its digest is kept on disk.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoveryToken(String);

impl RecoveryToken {
    fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    fn digest(&self) -> String {
        sha256_hex(self.0.as_bytes())
    }
}

impl std::fmt::Debug for RecoveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecoveryToken(..)")
    }
}

#[derive(Debug)]
pub struct EnsuredAccount {
    pub account: Account,
    /// Present only on the call that created the account.
    pub recovery_token: Option<RecoveryToken>,
}

pub struct AccountStore {
    workdir: WorkDir,
    keystore: KeyStore,
}

impl AccountStore {
    pub fn new(workdir: WorkDir, keystore: KeyStore) -> Self {
        Self { workdir, keystore }
    }

    /// Load the stored account, checking that its registration belongs to the stored key.
    pub fn load(&self) -> Result<Option<Account>> {
        let registration_path = self.workdir.registration_path();
        let encoded = match fs::read_to_string(&registration_path) {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no stored account");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let record: RegistrationRecord = serde_json::from_str(&encoded)?;
        let key = self
            .keystore
            .load_account_key(&self.workdir.account_credentials_path())?
            .ok_or_else(|| Error::Registration("account key is missing".into()))?;
        if key.fingerprint() != record.key_fingerprint {
            return Err(Error::Registration(format!(
                "stored registration {} does not belong to the stored account key",
                record.account_uri
            )));
        }
        Ok(Some(Account {
            account_uri: record.account_uri,
            contact: record.contact,
            status: record.status,
            created_at: record.created_at,
            key,
        }))
    }

    /// Load the account, registering a new one with the CA if none exists.
    ///
    /// Never re-registers and never rotates the key of an existing account.
    pub async fn ensure_registered<A: AcmeApi>(
        &self,
        client: &ProtocolClient<A>,
        contact_email: &str,
        agree_tos: bool,
    ) -> Result<EnsuredAccount> {
        let contact = contact_uris(contact_email);
        if let Some(account) = self.load()? {
            if account.contact != contact {
                warn!(
                    account = %account.account_uri,
                    "ignoring contact change for existing account"
                );
            }
            return Ok(EnsuredAccount {
                account,
                recovery_token: None,
            });
        }

        info!("registering new ACME account");
        let registration = client
            .register(&contact, agree_tos)
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;
        let recovery_token = RecoveryToken::generate();
        let record = RegistrationRecord {
            account_uri: registration.account_uri.clone(),
            contact: contact.clone(),
            status: AccountStatus::Valid,
            key_fingerprint: registration.key.fingerprint(),
            created_at: OffsetDateTime::now_utc(),
            recovery_token_digest: recovery_token.digest(),
        };
        self.persist(&record, &registration.key)?;
        info!(account = %record.account_uri, "registered new ACME account");

        Ok(EnsuredAccount {
            account: Account {
                account_uri: record.account_uri,
                contact: record.contact,
                status: record.status,
                created_at: record.created_at,
                key: registration.key,
            },
            recovery_token: Some(recovery_token),
        })
    }

    /// Write key and registration into a staging directory and move it into
    /// place in one rename, so a half-written account is never observable.
    fn persist(&self, record: &RegistrationRecord, key: &AccountKey) -> Result<()> {
        let account_dir = self.workdir.account_dir();
        fs::create_dir_all(self.workdir.workdir())?;
        let staging = self
            .workdir
            .workdir()
            .join(format!(".account-staging-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&staging)?;
        let result = (|| -> Result<()> {
            self.keystore
                .save_account_key(&staging.join(CREDENTIALS_FILE), key)?;
            write_private(
                &staging.join(REGISTRATION_FILE),
                &serde_json::to_vec_pretty(record)?,
            )?;
            if account_dir.exists() {
                // Left behind by an earlier crash: nothing is registered in it.
                fs::remove_dir_all(&account_dir)?;
            }
            fs::rename(&staging, &account_dir).context("failed to move account into place")?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }
}

fn contact_uris(email: &str) -> Vec<String> {
    let email = email.trim();
    if email.is_empty() {
        return vec![];
    }
    if email.starts_with("mailto:") {
        vec![email.to_string()]
    } else {
        vec![format!("mailto:{email}")]
    }
}
