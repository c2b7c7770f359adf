use std::{path::PathBuf, time::Duration};

use crate::workdir::WorkDir;

/// Backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Bounded polling of authorization and certificate readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(2),
        }
    }
}

#[allow(clippy::duplicated_attributes)]
#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
#[builder(on(PathBuf, into))]
pub struct LifecycleConfig {
    /// Root of the configuration directory.
    workdir: PathBuf,
    /// ACME directory URL.
    acme_url: String,
    #[builder(default = true)]
    agree_tos: bool,
    #[builder(default = 4)]
    max_concurrent_authorizations: usize,
    #[builder(default)]
    retry: RetryPolicy,
    #[builder(default)]
    poll: PollPolicy,
    #[builder(default = Duration::from_secs(30 * 24 * 3600))]
    renew_before: Duration,
    checkpoint_retention: Option<usize>,
}

impl LifecycleConfig {
    pub fn workdir(&self) -> WorkDir {
        WorkDir::new(&self.workdir)
    }

    pub fn acme_url(&self) -> &str {
        &self.acme_url
    }

    pub fn agree_tos(&self) -> bool {
        self.agree_tos
    }

    pub fn max_concurrent_authorizations(&self) -> usize {
        self.max_concurrent_authorizations.max(1)
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn poll(&self) -> PollPolicy {
        self.poll
    }

    pub fn renew_before(&self) -> Duration {
        self.renew_before
    }

    pub fn checkpoint_retention(&self) -> Option<usize> {
        self.checkpoint_retention
    }
}
