use std::path::{Path, PathBuf};

/// Layout of one configuration directory.
///
/// ```text
/// <workdir>/
/// ├── account/            registration.json, credentials.json
/// ├── vault/              one directory per certificate bundle
/// ├── checkpoints/        <seq>/{manifest.json, account/, vault/}
/// └── live/<domain>/      symlinks to the newest active bundle
/// ```
#[derive(Debug, Clone)]
pub struct WorkDir {
    workdir: PathBuf,
}

impl WorkDir {
    pub fn new(workdir: impl AsRef<Path>) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    pub fn account_dir(&self) -> PathBuf {
        self.workdir.join("account")
    }

    pub fn registration_path(&self) -> PathBuf {
        self.account_dir().join("registration.json")
    }

    pub fn account_credentials_path(&self) -> PathBuf {
        self.account_dir().join("credentials.json")
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.workdir.join("vault")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.workdir.join("checkpoints")
    }

    pub fn live_dir(&self) -> PathBuf {
        self.workdir.join("live")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.workdir.join("certman.lock")
    }

    /// Directories captured by a checkpoint, relative to the workdir.
    pub(crate) fn snapshot_roots() -> [&'static str; 2] {
        ["account", "vault"]
    }
}
