//! Persisted store of issued certificates.
//!
//! Every bundle lives in its own directory under `vault/`:
//!
//! ```text
//! vault/<first-domain>-<set hash>-<issued nanos>/
//! ├── cert.pem      full chain as returned by the CA
//! ├── key.pem       certificate key, mode 0600
//! ├── meta.json     domains, validity and content digests
//! └── revoked.json  tombstone, present once revoked
//! ```
//!
//! Bundles are built in a `.staging-*` directory and renamed into place, so a
//! reader sees either a whole bundle or nothing. Revocation writes a tombstone
//! instead of deleting anything.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use x509_parser::prelude::{GeneralName, Pem};

use crate::{
    error::{Error, Result},
    keystore::{sha256_hex, AccountKey, CertKey},
    protocol::{AcmeApi, ProtocolClient},
    workdir::WorkDir,
};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const META_FILE: &str = "meta.json";
const TOMBSTONE_FILE: &str = "revoked.json";
const STAGING_PREFIX: &str = ".staging-";

/// A certificate fresh from the CA, not yet stored.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub domains: Vec<String>,
    pub chain_pem: String,
    pub key: CertKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    /// Normalized domains in the order they were requested.
    pub domains: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    pub serial: String,
    pub cert_sha256: String,
    pub key_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    #[serde(with = "time::serde::rfc3339")]
    pub revoked_at: OffsetDateTime,
    pub reason: Option<String>,
}

/// A bundle read back from the vault. Reading it has verified its digests.
#[derive(Debug, Clone)]
pub struct StoredBundle {
    pub id: String,
    pub meta: BundleMeta,
    pub revocation: Option<Revocation>,
    pub chain_pem: String,
    key: CertKey,
    dir: PathBuf,
}

impl StoredBundle {
    pub fn key(&self) -> &CertKey {
        &self.key
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Whether the certificate expires within `window` of `now`.
    pub fn expires_within(&self, now: OffsetDateTime, window: std::time::Duration) -> bool {
        self.meta.not_after < now + window
    }

    fn leaf(&self) -> Result<LeafInfo> {
        inspect_leaf(&self.chain_pem).map_err(|e| Error::integrity(&self.id, format!("{e:#}")))
    }
}

/// Result of [`CertificateVault::revoke`].
#[derive(Debug, Clone)]
pub enum RevokeOutcome {
    /// Tombstoned now and revoked with the CA.
    Revoked(StoredBundle),
    /// Already tombstoned earlier; nothing was changed.
    AlreadyRevoked(StoredBundle),
}

impl RevokeOutcome {
    pub fn bundle(&self) -> &StoredBundle {
        match self {
            RevokeOutcome::Revoked(bundle) | RevokeOutcome::AlreadyRevoked(bundle) => bundle,
        }
    }
}

pub struct CertificateVault {
    workdir: WorkDir,
}

impl CertificateVault {
    /// Open the vault, discarding bundles that never finished staging.
    pub fn open(workdir: WorkDir) -> Result<Self> {
        let vault_dir = workdir.vault_dir();
        fs::create_dir_all(&vault_dir)?;
        for entry in fs::read_dir(&vault_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(STAGING_PREFIX) {
                warn!("removing incomplete bundle {}", entry.path().display());
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(Self { workdir })
    }

    /// Persist a bundle as one unit and return it as stored.
    pub fn store(&self, issued: IssuedCertificate) -> Result<StoredBundle> {
        let domains = normalize_domains(&issued.domains);
        let Some(first) = domains.first() else {
            return Err(anyhow::anyhow!("cannot store a certificate without domains").into());
        };
        let leaf = inspect_leaf(&issued.chain_pem).context("invalid certificate chain")?;
        if leaf.spki != issued.key.public_key_der()? {
            return Err(anyhow::anyhow!("certificate does not belong to the given key").into());
        }
        let names = sorted_set(&leaf.dns_names);
        if names != sorted_set(&domains) {
            return Err(anyhow::anyhow!(
                "certificate names [{}] do not match the requested domains [{}]",
                names.join(", "),
                domains.join(", ")
            )
            .into());
        }

        let issued_at = OffsetDateTime::now_utc();
        let id = format!(
            "{}-{}-{}",
            first,
            &set_digest(&domains)[..8],
            issued_at.unix_timestamp_nanos()
        );
        let meta = BundleMeta {
            domains,
            issued_at,
            not_after: leaf.not_after,
            serial: leaf.serial,
            cert_sha256: sha256_hex(issued.chain_pem.as_bytes()),
            key_sha256: sha256_hex(issued.key.pem().as_bytes()),
        };

        let vault_dir = self.workdir.vault_dir();
        let staging = vault_dir.join(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4()));
        let dir = vault_dir.join(&id);
        fs::create_dir_all(&staging)?;
        let result = (|| -> Result<()> {
            write_synced(&staging.join(CERT_FILE), issued.chain_pem.as_bytes(), 0o644)?;
            write_synced(&staging.join(KEY_FILE), issued.key.pem().as_bytes(), 0o600)?;
            write_synced(
                &staging.join(META_FILE),
                &serde_json::to_vec_pretty(&meta)?,
                0o644,
            )?;
            fs::File::open(&staging)?.sync_all()?;
            fs::rename(&staging, &dir)?;
            Ok(())
        })();
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        info!(bundle = %id, "stored certificate bundle");

        Ok(StoredBundle {
            id,
            meta,
            revocation: None,
            chain_pem: issued.chain_pem,
            key: issued.key,
            dir,
        })
    }

    /// Newest non-revoked bundle for exactly this domain set.
    ///
    /// Only bundles issued for this set can fail the lookup with
    /// [`Error::VaultIntegrity`]; damaged bundles of other sets are skipped.
    pub fn lookup(&self, domains: &[String]) -> Result<Option<StoredBundle>> {
        let wanted = sorted_set(domains);
        let digest = set_digest(&wanted);
        let mut newest: Option<StoredBundle> = None;
        for (id, dir) in self.bundle_dirs()? {
            let candidate = id_set_digest(&id) == Some(&digest[..8]);
            let bundle = match self.read_bundle(&id, dir) {
                Ok(bundle) => bundle,
                Err(err @ Error::VaultIntegrity { .. }) if !candidate => {
                    warn!(bundle = %id, "skipping damaged bundle: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if bundle.is_revoked() || sorted_set(&bundle.meta.domains) != wanted {
                continue;
            }
            if newest
                .as_ref()
                .map_or(true, |current| age_key(&bundle) > age_key(current))
            {
                newest = Some(bundle);
            }
        }
        Ok(newest)
    }

    pub fn get(&self, id: &str) -> Result<StoredBundle> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(Error::BundleNotFound(id.to_string()));
        }
        let dir = self.workdir.vault_dir().join(id);
        if !dir.is_dir() {
            return Err(Error::BundleNotFound(id.to_string()));
        }
        self.read_bundle(id, dir)
    }

    /// Every bundle, revoked ones included, oldest first.
    pub fn list(&self) -> Result<Vec<StoredBundle>> {
        let mut bundles = vec![];
        for (id, dir) in self.bundle_dirs()? {
            bundles.push(self.read_bundle(&id, dir)?);
        }
        bundles.sort_by(|a, b| age_key(a).cmp(&age_key(b)));
        Ok(bundles)
    }

    fn bundle_dirs(&self) -> Result<Vec<(String, PathBuf)>> {
        let entries = match fs::read_dir(self.workdir.vault_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut dirs = vec![];
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            dirs.push((name, entry.path()));
        }
        Ok(dirs)
    }

    /// Active bundles whose certificate was issued for `key`.
    pub fn find_by_key(&self, key: &CertKey) -> Result<Vec<StoredBundle>> {
        let spki = key.public_key_der()?;
        let mut found = vec![];
        for bundle in self.list()? {
            if !bundle.is_revoked() && bundle.leaf()?.spki == spki {
                found.push(bundle);
            }
        }
        Ok(found)
    }

    /// Tombstone the bundle and revoke it with the CA.
    ///
    /// If the CA refuses, the tombstone is removed again and the bundle stays
    /// active.
    pub async fn revoke<A: AcmeApi>(
        &self,
        id: &str,
        client: &ProtocolClient<A>,
        account_key: &AccountKey,
        reason: Option<String>,
    ) -> Result<RevokeOutcome> {
        let mut bundle = self.get(id)?;
        if bundle.is_revoked() {
            warn!(bundle = %id, "bundle is already revoked");
            return Ok(RevokeOutcome::AlreadyRevoked(bundle));
        }
        let der = bundle.leaf()?.der;
        let revocation = Revocation {
            revoked_at: OffsetDateTime::now_utc(),
            reason,
        };
        let tombstone = bundle.dir.join(TOMBSTONE_FILE);
        safe_write::safe_write(&tombstone, serde_json::to_vec_pretty(&revocation)?)?;
        debug!(bundle = %id, "tombstone written, revoking with CA");

        if let Err(err) = client.revoke(account_key, &der).await {
            if let Err(e) = fs::remove_file(&tombstone) {
                warn!(bundle = %id, "failed to remove tombstone after failed revocation: {e}");
            }
            return Err(err);
        }
        bundle.revocation = Some(revocation);
        Ok(RevokeOutcome::Revoked(bundle))
    }

    /// Point `live/<first-domain>/` at the bundle.
    pub fn link_live(&self, bundle: &StoredBundle) -> Result<()> {
        use path_absolutize::Absolutize;

        let Some(first) = bundle.meta.domains.first() else {
            return Ok(());
        };
        let live = self.workdir.live_dir().join(first);
        ln_force(bundle.cert_path().absolutize()?, live.join(CERT_FILE))?;
        ln_force(bundle.key_path().absolutize()?, live.join(KEY_FILE))?;
        debug!(bundle = %bundle.id, "updated live links in {}", live.display());
        Ok(())
    }

    fn read_bundle(&self, id: &str, dir: PathBuf) -> Result<StoredBundle> {
        let read = |name: &str| {
            fs::read_to_string(dir.join(name)).map_err(|e| Error::integrity(id, e))
        };
        let meta: BundleMeta =
            serde_json::from_str(&read(META_FILE)?).map_err(|e| Error::integrity(id, e))?;
        let chain_pem = read(CERT_FILE)?;
        let key_pem = read(KEY_FILE)?;
        if sha256_hex(chain_pem.as_bytes()) != meta.cert_sha256 {
            return Err(Error::integrity(id, "certificate digest mismatch"));
        }
        if sha256_hex(key_pem.as_bytes()) != meta.key_sha256 {
            return Err(Error::integrity(id, "key digest mismatch"));
        }
        inspect_leaf(&chain_pem).map_err(|e| Error::integrity(id, format!("{e:#}")))?;

        let revocation = match fs::read_to_string(dir.join(TOMBSTONE_FILE)) {
            Ok(encoded) => {
                Some(serde_json::from_str(&encoded).map_err(|e| Error::integrity(id, e))?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(StoredBundle {
            id: id.to_string(),
            meta,
            revocation,
            chain_pem,
            key: CertKey::from_pem(key_pem),
            dir,
        })
    }
}

/// Lowercase, strip trailing dots and drop duplicates, keeping the order.
pub fn normalize_domains(domains: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(domains.len());
    for domain in domains {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if !domain.is_empty() && !normalized.contains(&domain) {
            normalized.push(domain);
        }
    }
    normalized
}

fn sorted_set(domains: &[String]) -> Vec<String> {
    let mut set = normalize_domains(domains);
    set.sort();
    set
}

fn set_digest(domains: &[String]) -> String {
    sha256_hex(sorted_set(domains).join(",").as_bytes())
}

/// The set digest embedded in a bundle id (`<first>-<digest>-<nanos>`).
fn id_set_digest(id: &str) -> Option<&str> {
    let mut parts = id.rsplitn(3, '-');
    parts.next()?;
    let digest = parts.next()?;
    parts.next()?;
    Some(digest)
}

fn age_key(bundle: &StoredBundle) -> (OffsetDateTime, &str) {
    (bundle.meta.issued_at, bundle.id.as_str())
}

struct LeafInfo {
    der: Vec<u8>,
    spki: Vec<u8>,
    serial: String,
    not_after: OffsetDateTime,
    dns_names: Vec<String>,
}

fn read_pem(cert_pem: &str) -> anyhow::Result<Pem> {
    Pem::iter_from_buffer(cert_pem.as_bytes())
        .next()
        .transpose()
        .context("invalid pem")?
        .context("no certificate in pem")
}

fn inspect_leaf(chain_pem: &str) -> anyhow::Result<LeafInfo> {
    let pem = read_pem(chain_pem)?;
    let cert = pem.parse_x509().context("invalid x509 certificate")?;
    let mut dns_names = vec![];
    if let Some(san) = cert
        .tbs_certificate
        .subject_alternative_name()
        .context("failed to parse subject alternative name")?
    {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }
    Ok(LeafInfo {
        dns_names,
        spki: cert.public_key().raw.to_vec(),
        serial: cert.raw_serial_as_string(),
        not_after: cert.validity().not_after.to_datetime(),
        der: pem.contents.clone(),
    })
}

/// Create `path` with `mode` from the start and flush it to disk.
fn write_synced(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use fs_err::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()?;
    Ok(())
}

fn ln_force(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let dst = dst.as_ref();
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst)?;
    } else if let Some(dst_parent) = dst.parent() {
        fs::create_dir_all(dst_parent)?;
    }
    fs::os::unix::fs::symlink(src.as_ref(), dst)?;
    Ok(())
}

#[cfg(test)]
mod tests;
