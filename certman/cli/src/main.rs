use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use certman::{
    AcmeClient, CertificateRef, ChallengeBackend, ChallengeKind, HookProvider, LifecycleConfig,
    LifecycleOrchestrator, Operation, Outcome, TracingDiagnostics,
};
use clap::Parser;
use documented::DocumentedFields;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use toml_edit::ser::to_document;
use tracing::warn;

use lock::DirLock;

mod lock;

#[derive(Parser)]
enum Command {
    /// Register the account if needed and issue or renew the certificate
    Run {
        /// Issue a new certificate even if the current one is still fresh
        #[arg(long)]
        force: bool,
    },
    /// Authorize domains without issuing
    Auth,
    /// Install the certificate into a server configuration
    Install,
    /// Revoke certificates
    Revoke {
        #[command(flatten)]
        target: RevokeTarget,
        /// Revocation reason recorded in the tombstone
        #[arg(long)]
        reason: Option<String>,
    },
    /// Roll back to an earlier checkpoint
    Rollback {
        /// How many checkpoints to go back from the newest one
        #[arg(long, default_value_t = 1)]
        checkpoints: usize,
    },
    /// Restore a checkpoint by sequence number
    Restore {
        /// Checkpoint sequence number
        sequence: u64,
    },
    /// List stored certificates and checkpoints
    List,
    /// Generate configuration template
    Cfg {
        /// Write to file
        #[arg(short, long)]
        write_to: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct RevokeTarget {
    /// Bundle id as shown by `list`
    #[arg(long)]
    certificate: Option<String>,
    /// Comma separated domain set of the certificate
    #[arg(long, value_delimiter = ',')]
    domains: Option<Vec<String>>,
    /// Revoke every certificate issued for this private key
    #[arg(long)]
    key: Option<PathBuf>,
}

impl RevokeTarget {
    fn into_ref(self) -> Result<CertificateRef> {
        match (self.certificate, self.domains, self.key) {
            (Some(id), None, None) => Ok(CertificateRef::Bundle(id)),
            (None, Some(domains), None) => Ok(CertificateRef::Domains(domains)),
            (None, None, Some(key)) => Ok(CertificateRef::Key(key)),
            _ => bail!("exactly one of --certificate, --domains or --key is required"),
        }
    }
}

#[derive(Parser)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "certman.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Deserialize, Serialize, DocumentedFields)]
struct Config {
    /// Path to the working directory
    workdir: PathBuf,
    /// ACME server URL
    acme_url: String,
    /// Contact email for the ACME account
    email: String,
    /// Domains to issue the certificate for
    domains: Vec<String>,
    /// Agree to the terms of service of the ACME server
    agree_tos: bool,
    /// Maximum number of domains authorized at the same time
    max_concurrent_authorizations: usize,
    /// Number of days before expiration to trigger renewal
    renew_days_before: u64,
    /// Operation timeout in seconds, 0 for none
    timeout: u64,
    /// Serve HTTP-01 challenges from this web root
    #[serde(default)]
    webroot: Option<PathBuf>,
    /// Number of checkpoints to keep, all of them if unset
    #[serde(default)]
    checkpoint_retention: Option<usize>,
    /// Challenge types the hook commands can satisfy
    #[serde(default = "default_hook_challenges")]
    hook_challenges: Vec<ChallengeKind>,
    /// Shell command publishing a challenge, used instead of `webroot`.
    /// It gets CERTMAN_DOMAIN, CERTMAN_CHALLENGE, CERTMAN_TOKEN and CERTMAN_PROOF.
    #[serde(default)]
    publish_hook: Option<String>,
    /// Shell command removing a published challenge
    #[serde(default)]
    cleanup_hook: Option<String>,
}

fn default_hook_challenges() -> Vec<ChallengeKind> {
    vec![ChallengeKind::Dns01]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: ".".into(),
            acme_url: "https://acme-staging-v02.api.letsencrypt.org/directory".into(),
            email: "ops@example.com".into(),
            domains: vec!["example.com".into()],
            agree_tos: true,
            max_concurrent_authorizations: 4,
            renew_days_before: 30,
            timeout: 600,
            webroot: Some("/var/www/html".into()),
            checkpoint_retention: Some(10),
            hook_challenges: default_hook_challenges(),
            publish_hook: None,
            cleanup_hook: None,
        }
    }
}

impl Config {
    fn load(path: &Path) -> Result<Self> {
        Ok(toml_edit::de::from_str(&fs::read_to_string(path)?)?)
    }

    fn to_commented_toml(&self) -> Result<String> {
        let mut doc = to_document(self)?;

        for (mut key, _value) in doc.iter_mut() {
            let Ok(docstring) = Self::get_field_docs(key.get()) else {
                continue;
            };
            let decor = key.leaf_decor_mut();

            let mut comment = String::new();
            for line in docstring.lines() {
                let line = if line.is_empty() {
                    String::from("#\n")
                } else {
                    format!("# {line}\n")
                };
                comment.push_str(&line);
            }
            decor.set_prefix(comment);
        }
        Ok(doc.to_string())
    }

    fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig::builder()
            .workdir(&self.workdir)
            .acme_url(&self.acme_url)
            .agree_tos(self.agree_tos)
            .max_concurrent_authorizations(self.max_concurrent_authorizations)
            .renew_before(Duration::from_secs(self.renew_days_before * 24 * 60 * 60))
            .maybe_checkpoint_retention(self.checkpoint_retention)
            .build()
    }

    fn provider(&self) -> Result<ChallengeBackend> {
        if let Some(publish) = &self.publish_hook {
            return Ok(ChallengeBackend::Hook(HookProvider::new(
                self.hook_challenges.clone(),
                publish,
                self.cleanup_hook.clone(),
            )));
        }
        match &self.webroot {
            Some(webroot) => Ok(ChallengeBackend::webroot(webroot)),
            None => bail!("either `webroot` or `publish_hook` must be configured"),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

/// Cancel on Ctrl-C or when the timeout expires.
fn cancel_on_interrupt(cancel: CancellationToken, timeout: Option<Duration>) {
    tokio::spawn(async move {
        let expired = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::signal::ctrl_c() => warn!("interrupted, cleaning up"),
            _ = expired => warn!("timed out, cleaning up"),
        }
        cancel.cancel();
    });
}

async fn run_command(config_path: &Path, command: Command) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    let lifecycle = config.lifecycle();
    let _lock = DirLock::acquire(lifecycle.workdir().lock_path())?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone(), config.timeout());
    let engine = LifecycleOrchestrator::new(
        lifecycle,
        AcmeClient::new(&config.acme_url),
        config.provider()?,
        Arc::new(TracingDiagnostics),
        cancel.clone(),
    )?;

    let operation = match command {
        Command::Run { force } => Operation::Run {
            domains: config.domains.clone(),
            contact_email: config.email.clone(),
            force,
        },
        Command::Auth => Operation::Auth,
        Command::Install => Operation::Install,
        Command::Revoke { target, reason } => Operation::Revoke {
            certificate: target.into_ref()?,
            reason,
        },
        Command::Rollback { checkpoints } => Operation::Rollback(checkpoints),
        Command::Restore { sequence } => Operation::Restore(sequence),
        Command::List => {
            print_listing(&engine)?;
            return Ok(());
        }
        Command::Cfg { .. } => bail!("`cfg` does not operate on a configuration directory"),
    };
    let outcome = engine.execute(operation).await;
    cancel.cancel();
    match outcome? {
        Outcome::Run(summary) => {
            if let Some(token) = &summary.recovery_token {
                println!("Account {} registered.", summary.account_uri);
                println!("Recovery token (shown only once): {}", token.expose());
            }
            if summary.renewed {
                println!("Issued {} for {}", summary.bundle, summary.domains.join(", "));
            } else {
                println!("{} is still valid, nothing to do", summary.bundle);
            }
            match summary.checkpoint {
                Some(sequence) => println!("Checkpoint {sequence} created"),
                None if summary.renewed => println!("Warning: no checkpoint was created"),
                None => {}
            }
        }
        Outcome::Revoked(summary) => {
            for bundle in &summary.bundles {
                println!("Revoked {bundle}");
            }
            for bundle in &summary.already_revoked {
                println!("{bundle} was already revoked");
            }
            if let Some(sequence) = summary.checkpoint {
                println!("Checkpoint {sequence} created");
            }
        }
        Outcome::RolledBack(sequence) => println!("Restored checkpoint {sequence}"),
    }
    Ok(())
}

fn print_listing<A: certman::AcmeApi>(
    engine: &LifecycleOrchestrator<A, ChallengeBackend>,
) -> Result<()> {
    println!("Certificates:");
    for bundle in engine.vault().list()? {
        let state = if bundle.is_revoked() { "revoked" } else { "active" };
        println!(
            "  {}  {}  expires {}  [{}]",
            bundle.id,
            bundle.meta.domains.join(","),
            bundle.meta.not_after,
            state
        );
    }
    println!("Checkpoints:");
    for manifest in engine.checkpoints().list()? {
        println!("  {}  {}", manifest.sequence, manifest.created_at);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let args = Args::parse();
    match args.command {
        Command::Cfg { write_to } => {
            let toml_str = Config::default().to_commented_toml()?;
            match write_to {
                Some(path) => fs::write(path, toml_str)?,
                None => println!("{}", toml_str),
            }
        }
        command => run_command(&args.config, command).await?,
    }
    Ok(())
}
