//! Private key material at rest.
//!
//! The account key is held as the opaque credential blob produced during
//! registration; certificate keys are PKCS#8 PEM generated locally. Both are
//! written with `safe_write` and restricted to the owner.

use std::path::Path;

use anyhow::Context;
use fs_err as fs;
use rcgen::KeyPair;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;

/// Account key material as handed out by the protocol backend.
///
/// Opaque to the engine: it is only persisted, fingerprinted and handed back
/// to the protocol client for signing.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountKey {
    material: String,
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl AccountKey {
    pub fn new(material: impl Into<String>) -> Self {
        Self {
            material: material.into(),
        }
    }

    pub fn material(&self) -> &str {
        &self.material
    }

    pub fn fingerprint(&self) -> String {
        sha256_hex(self.material.as_bytes())
    }
}

/// A freshly generated certificate-request key, PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct CertKey {
    pem: String,
}

impl std::fmt::Debug for CertKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CertKey(..)")
    }
}

impl CertKey {
    pub fn from_pem(pem: impl Into<String>) -> Self {
        Self { pem: pem.into() }
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// DER encoded SubjectPublicKeyInfo of this key.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let key = KeyPair::from_pem(&self.pem).context("failed to parse private key")?;
        Ok(key.public_key_der())
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyStore;

impl KeyStore {
    pub fn new() -> Self {
        Self
    }

    /// Generate a new certificate key, distinct from the account key.
    pub fn generate_cert_key(&self) -> Result<CertKey> {
        let key = KeyPair::generate().context("failed to generate key")?;
        debug!("generated new certificate key pair");
        Ok(CertKey::from_pem(key.serialize_pem()))
    }

    pub fn load_cert_key(&self, path: &Path) -> Result<CertKey> {
        let pem = fs::read_to_string(path)?;
        KeyPair::from_pem(&pem).context("failed to parse private key")?;
        Ok(CertKey::from_pem(pem))
    }

    pub fn save_account_key(&self, path: &Path, key: &AccountKey) -> Result<()> {
        write_private(path, key.material().as_bytes())
    }

    pub fn load_account_key(&self, path: &Path) -> Result<Option<AccountKey>> {
        match fs::read_to_string(path) {
            Ok(material) => Ok(Some(AccountKey::new(material))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Atomically write a file readable only by the owner.
pub(crate) fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    safe_write::safe_write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
