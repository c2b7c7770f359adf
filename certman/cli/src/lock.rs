use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use fs_err as fs;
use tracing::{debug, warn};

/// Advisory lock on a configuration directory, held until dropped.
///
/// A lock left behind by a process that no longer exists is taken over.
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                let holder = holder.trim();
                match holder.parse::<u32>() {
                    Ok(pid) if !process_alive(pid) => {
                        warn!("taking over stale lock {} of process {pid}", path.display());
                        fs::remove_file(&path)?;
                        create_lock_file(&path).context("failed to create lock file")?
                    }
                    _ => bail!(
                        "{} is held by process {}; remove it if that process is gone",
                        path.display(),
                        holder
                    ),
                }
            }
            Err(e) => return Err(e).context("failed to create lock file"),
        };
        writeln!(file, "{}", std::process::id())?;
        debug!("acquired {}", path.display());
        Ok(Self { path })
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without procfs there is no cheap check, so the holder is assumed alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to release lock: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("certman.lock");
        let lock = DirLock::acquire(&path).unwrap();
        let err = DirLock::acquire(&path).err().unwrap();
        assert!(err.to_string().contains("held by process"), "{err}");
        drop(lock);
        assert!(!path.exists());
        DirLock::acquire(&path).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("certman.lock");
        // Above any pid the kernel hands out.
        std::fs::write(&path, format!("{}\n", u32::MAX)).unwrap();
        let lock = DirLock::acquire(&path).unwrap();
        let holder = std::fs::read_to_string(&path).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
        drop(lock);

        // A live holder still blocks.
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(DirLock::acquire(&path).is_err());
    }
}
