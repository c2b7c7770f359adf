use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::debug;

use super::{ChallengeKind, ChallengeProvider, ChallengeToken};

/// Delegates publication to operator supplied shell commands.
///
/// Both commands run under `/bin/sh -c` with `CERTMAN_DOMAIN`,
/// `CERTMAN_CHALLENGE`, `CERTMAN_TOKEN` and `CERTMAN_PROOF` in the environment.
#[derive(Debug, Clone)]
pub struct HookProvider {
    kinds: Vec<ChallengeKind>,
    publish_cmd: String,
    cleanup_cmd: Option<String>,
}

impl HookProvider {
    pub fn new(
        kinds: Vec<ChallengeKind>,
        publish_cmd: impl Into<String>,
        cleanup_cmd: Option<String>,
    ) -> Self {
        Self {
            kinds,
            publish_cmd: publish_cmd.into(),
            cleanup_cmd,
        }
    }

    async fn run_hook(&self, cmd: &str, domain: &str, token: &ChallengeToken) -> Result<()> {
        debug!(domain, challenge = %token.kind, "running challenge hook");
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .env("CERTMAN_DOMAIN", domain)
            .env("CERTMAN_CHALLENGE", token.kind.as_str())
            .env("CERTMAN_TOKEN", &token.token)
            .env("CERTMAN_PROOF", &token.proof)
            .status()
            .await
            .context("failed to spawn hook")?;
        if !status.success() {
            bail!("hook failed with status: {status}");
        }
        Ok(())
    }
}

impl ChallengeProvider for HookProvider {
    fn supported(&self) -> Vec<ChallengeKind> {
        self.kinds.clone()
    }

    async fn publish(&self, domain: &str, token: &ChallengeToken) -> Result<()> {
        self.run_hook(&self.publish_cmd, domain, token).await
    }

    async fn cleanup(&self, domain: &str, token: &ChallengeToken) -> Result<()> {
        match &self.cleanup_cmd {
            Some(cmd) => self.run_hook(cmd, domain, token).await,
            None => Ok(()),
        }
    }
}
