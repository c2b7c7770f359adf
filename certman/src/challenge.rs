use std::{fmt, str::FromStr};

use anyhow::{bail, Result};
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

pub use hook::HookProvider;
pub use webroot::WebrootProvider;

mod hook;
mod webroot;

/// Challenge types, ordered from cheapest to most expensive to automate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChallengeKind {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::TlsAlpn01 => "tls-alpn-01",
            ChallengeKind::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "http-01" => ChallengeKind::Http01,
            "tls-alpn-01" => ChallengeKind::TlsAlpn01,
            "dns-01" => ChallengeKind::Dns01,
            _ => bail!("unknown challenge type: {s}"),
        })
    }
}

/// Everything a provider needs to make a challenge retrievable by the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    pub kind: ChallengeKind,
    /// Token issued by the CA.
    pub token: String,
    /// Value to publish: the key authorization for http-01 and tls-alpn-01,
    /// its base64url SHA-256 digest for dns-01.
    pub proof: String,
}

/// Capability that provisions challenge responses.
///
/// `cleanup` is best-effort: callers log its failures and carry on.
#[enum_dispatch]
#[allow(async_fn_in_trait)]
pub trait ChallengeProvider {
    /// Challenge types this provider can satisfy.
    fn supported(&self) -> Vec<ChallengeKind>;

    async fn publish(&self, domain: &str, token: &ChallengeToken) -> Result<()>;

    async fn cleanup(&self, domain: &str, token: &ChallengeToken) -> Result<()>;
}

/// The providers shipped with the CLI.
#[derive(Debug, Clone)]
#[enum_dispatch(ChallengeProvider)]
pub enum ChallengeBackend {
    Webroot(WebrootProvider),
    Hook(HookProvider),
}

impl ChallengeBackend {
    pub fn webroot(root: impl Into<std::path::PathBuf>) -> Self {
        Self::Webroot(WebrootProvider::new(root))
    }
}

/// Pick the cheapest offered challenge the provider can satisfy.
pub fn select_challenge(
    offered: &[ChallengeKind],
    supported: &[ChallengeKind],
) -> Option<ChallengeKind> {
    offered
        .iter()
        .filter(|kind| supported.contains(kind))
        .min()
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChallengeKind::*;

    #[test]
    fn prefers_cheapest_supported() {
        assert_eq!(select_challenge(&[Dns01, Http01], &[Http01, Dns01]), Some(Http01));
        assert_eq!(select_challenge(&[Dns01, TlsAlpn01], &[Dns01, TlsAlpn01]), Some(TlsAlpn01));
        assert_eq!(select_challenge(&[Dns01, Http01], &[Dns01]), Some(Dns01));
        assert_eq!(select_challenge(&[TlsAlpn01], &[Http01, Dns01]), None);
        assert_eq!(select_challenge(&[], &[Http01]), None);
    }

    #[test]
    fn parse_kind() {
        assert_eq!("dns-01".parse::<ChallengeKind>().unwrap(), Dns01);
        assert_eq!(Http01.to_string(), "http-01");
        assert!("smtp-01".parse::<ChallengeKind>().is_err());
    }
}
