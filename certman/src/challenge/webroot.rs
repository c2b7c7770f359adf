use std::path::PathBuf;

use anyhow::{Context, Result};
use fs_err as fs;
use tracing::debug;

use super::{ChallengeKind, ChallengeProvider, ChallengeToken};

const CHALLENGE_PATH: &str = ".well-known/acme-challenge";

/// Serves http-01 responses by dropping files under a web server's document root.
#[derive(Debug, Clone)]
pub struct WebrootProvider {
    root: PathBuf,
}

impl WebrootProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn token_path(&self, token: &str) -> Result<PathBuf> {
        if token.is_empty() || token.contains(['/', '\\', '.']) {
            anyhow::bail!("refusing suspicious challenge token {token:?}");
        }
        Ok(self.root.join(CHALLENGE_PATH).join(token))
    }
}

impl ChallengeProvider for WebrootProvider {
    fn supported(&self) -> Vec<ChallengeKind> {
        vec![ChallengeKind::Http01]
    }

    async fn publish(&self, domain: &str, token: &ChallengeToken) -> Result<()> {
        let path = self.token_path(&token.token)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("failed to create challenge directory")?;
        }
        debug!(domain, path = %path.display(), "publishing http-01 response");
        fs::write(&path, &token.proof).context("failed to write challenge response")?;
        Ok(())
    }

    async fn cleanup(&self, domain: &str, token: &ChallengeToken) -> Result<()> {
        let path = self.token_path(&token.token)?;
        debug!(domain, path = %path.display(), "removing http-01 response");
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
