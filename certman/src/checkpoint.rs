//! Versioned full copies of the account and vault.
//!
//! `checkpoints/<seq>/` holds `account/`, `vault/` and a `manifest.json` with
//! a digest over both trees. Checkpoints are never modified once renamed
//! into place. Restoring swaps whole trees, never merges.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    workdir::WorkDir,
};

const MANIFEST_FILE: &str = "manifest.json";
const STAGING_PREFIX: &str = ".staging-";
const RESTORE_STAGING: &str = ".restore-staging";
const ROLLBACK_OLD: &str = ".rollback-old";
const ROLLBACK_DISCARD: &str = ".rollback-discard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub content_hash: String,
}

pub struct CheckpointStore {
    workdir: WorkDir,
}

impl CheckpointStore {
    /// Open the store, finishing the cleanup of anything a crash left behind.
    ///
    /// A restore that was interrupted mid-swap is undone, so live state is
    /// whatever it was before that restore started. A restore that got past
    /// its commit point only leaves the discarded trees, which are deleted.
    pub fn open(workdir: WorkDir) -> Result<Self> {
        let store = Self { workdir };
        let checkpoints = store.workdir.checkpoints_dir();
        fs::create_dir_all(&checkpoints)?;
        for entry in fs::read_dir(&checkpoints)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                warn!("removing incomplete checkpoint {}", entry.path().display());
                fs::remove_dir_all(entry.path())?;
            }
        }
        let old = store.workdir.workdir().join(ROLLBACK_OLD);
        if old.exists() {
            warn!("undoing interrupted restore");
            store.undo_swap(&old)?;
            fs::remove_dir_all(&old)?;
        }
        remove_dir_if_exists(&store.workdir.workdir().join(ROLLBACK_DISCARD))?;
        remove_dir_if_exists(&store.workdir.workdir().join(RESTORE_STAGING))?;
        Ok(store)
    }

    /// Capture the current account and vault. Returns the new sequence number.
    pub fn snapshot(&self) -> Result<u64> {
        let sequence = self.latest()?.map_or(1, |seq| seq + 1);
        let checkpoints = self.workdir.checkpoints_dir();
        let staging = checkpoints.join(format!("{STAGING_PREFIX}{sequence}"));
        remove_dir_if_exists(&staging)?;

        let result = (|| -> Result<()> {
            for root in WorkDir::snapshot_roots() {
                copy_tree(&self.workdir.workdir().join(root), &staging.join(root))?;
            }
            let manifest = CheckpointManifest {
                sequence,
                created_at: OffsetDateTime::now_utc(),
                content_hash: content_hash(&staging)?,
            };
            safe_write::safe_write(
                staging.join(MANIFEST_FILE),
                serde_json::to_vec_pretty(&manifest)?,
            )?;
            fs::rename(&staging, self.checkpoint_dir(sequence))?;
            Ok(())
        })();
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        info!(sequence, "created checkpoint");
        Ok(sequence)
    }

    /// Replace live account and vault with the contents of checkpoint `sequence`.
    pub fn restore(&self, sequence: u64) -> Result<()> {
        let dir = self.checkpoint_dir(sequence);
        if !dir.join(MANIFEST_FILE).is_file() {
            return Err(Error::CheckpointNotFound(sequence));
        }
        let manifest = read_manifest(&dir)?;
        if content_hash(&dir)? != manifest.content_hash {
            return Err(anyhow!("checkpoint {sequence} is corrupt: content hash mismatch").into());
        }

        let workdir = self.workdir.workdir();
        let incoming = workdir.join(RESTORE_STAGING);
        let old = workdir.join(ROLLBACK_OLD);
        remove_dir_if_exists(&incoming)?;
        for root in WorkDir::snapshot_roots() {
            copy_tree(&dir.join(root), &incoming.join(root))?;
        }
        fs::create_dir_all(&old)?;
        if let Err(err) = self.swap_in(&incoming, &old) {
            warn!(sequence, "restore failed, putting previous state back: {err}");
            self.undo_swap(&old)?;
            fs::remove_dir_all(&old)?;
            remove_dir_if_exists(&incoming)?;
            return Err(err);
        }
        // Commit point: once renamed, the previous trees are never put back.
        let discard = workdir.join(ROLLBACK_DISCARD);
        remove_dir_if_exists(&discard)?;
        fs::rename(&old, &discard)?;
        remove_dir_if_exists(&discard)?;
        remove_dir_if_exists(&incoming)?;
        info!(sequence, "restored checkpoint");
        Ok(())
    }

    /// Restore the checkpoint `steps` positions before the newest one.
    pub fn rollback(&self, steps: usize) -> Result<u64> {
        let checkpoints = self.list()?;
        if checkpoints.len() <= steps {
            return Err(Error::InsufficientHistory {
                requested: steps,
                available: checkpoints.len(),
            });
        }
        let target = checkpoints[checkpoints.len() - 1 - steps].sequence;
        self.restore(target)?;
        Ok(target)
    }

    /// All checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointManifest>> {
        let mut manifests = vec![];
        for sequence in self.sequences()? {
            manifests.push(read_manifest(&self.checkpoint_dir(sequence))?);
        }
        Ok(manifests)
    }

    pub fn latest(&self) -> Result<Option<u64>> {
        Ok(self.sequences()?.last().copied())
    }

    /// Delete all but the newest `keep` checkpoints. Returns the removed sequences.
    pub fn prune(&self, keep: usize) -> Result<Vec<u64>> {
        let sequences = self.sequences()?;
        let excess = sequences.len().saturating_sub(keep);
        let removed = sequences[..excess].to_vec();
        for sequence in &removed {
            fs::remove_dir_all(self.checkpoint_dir(*sequence))?;
            debug!(sequence, "pruned checkpoint");
        }
        Ok(removed)
    }

    fn checkpoint_dir(&self, sequence: u64) -> PathBuf {
        self.workdir.checkpoints_dir().join(sequence.to_string())
    }

    fn sequences(&self) -> Result<Vec<u64>> {
        let entries = match fs::read_dir(self.workdir.checkpoints_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut sequences = vec![];
        for entry in entries {
            let entry = entry?;
            if let Ok(sequence) = entry.file_name().to_string_lossy().parse::<u64>() {
                sequences.push(sequence);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    fn swap_in(&self, incoming: &Path, old: &Path) -> Result<()> {
        let workdir = self.workdir.workdir();
        for root in WorkDir::snapshot_roots() {
            let live = workdir.join(root);
            if live.exists() {
                fs::rename(&live, old.join(root))?;
            }
            fs::rename(incoming.join(root), &live)?;
        }
        Ok(())
    }

    fn undo_swap(&self, old: &Path) -> Result<()> {
        let workdir = self.workdir.workdir();
        for root in WorkDir::snapshot_roots() {
            let saved = old.join(root);
            if !saved.exists() {
                continue;
            }
            let live = workdir.join(root);
            remove_dir_if_exists(&live)?;
            fs::rename(&saved, &live)?;
        }
        Ok(())
    }
}

fn read_manifest(dir: &Path) -> Result<CheckpointManifest> {
    let encoded = fs::read_to_string(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_str(&encoded)?)
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Copy a directory tree, skipping unfinished staging entries.
///
/// A missing source produces an empty destination directory.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    if !src.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(STAGING_PREFIX) {
            continue;
        }
        let file_type = entry.file_type()?;
        let target = dst.join(&name);
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            warn!("not copying {} into checkpoint", entry.path().display());
        }
    }
    Ok(())
}

/// SHA-256 over the sorted relative paths and bytes of the snapshot trees under `base`.
pub(crate) fn content_hash(base: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for root in WorkDir::snapshot_roots() {
        hash_tree(&mut hasher, &base.join(root), root)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_tree(hasher: &mut Sha256, dir: &Path, rel: &str) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    hasher.update(rel.as_bytes());
    hasher.update(b"/\0");
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(STAGING_PREFIX) {
            continue;
        }
        let rel = format!("{rel}/{name}");
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            hash_tree(hasher, &entry.path(), &rel)?;
        } else if file_type.is_file() {
            let data = fs::read(entry.path())?;
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            hasher.update((data.len() as u64).to_be_bytes());
            hasher.update(&data);
        }
    }
    Ok(())
}
