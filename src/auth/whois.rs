//! Out-of-band Tailscale identity lookup.
//!
//! Identity headers are only supporting evidence. The login they claim is
//! confirmed by asking the local Tailscale daemon who owns the forwarded
//! client address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::types::UserLogin;

/// Default timeout for a single lookup.
pub const DEFAULT_WHOIS_TIMEOUT: Duration = Duration::from_secs(5);

/// Default lifetime of a cached identity.
pub const DEFAULT_WHOIS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Identity the tailnet reports for an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoisIdentity {
    pub login: UserLogin,
    pub display_name: Option<String>,
}

/// Errors from an identity lookup. All of them reject the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhoisError {
    /// The lookup did not finish in time.
    Timeout(Duration),
    /// The lookup command could not be started.
    Spawn(String),
    /// The lookup command exited unsuccessfully.
    CommandFailed(String),
    /// The lookup output was not understood.
    Parse(String),
    /// The address belongs to no known user.
    NoUser,
}

impl std::fmt::Display for WhoisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(d) => write!(f, "Identity lookup timed out after {:?}", d),
            Self::Spawn(msg) => write!(f, "Failed to start identity lookup: {}", msg),
            Self::CommandFailed(msg) => write!(f, "Identity lookup failed: {}", msg),
            Self::Parse(msg) => write!(f, "Failed to parse identity lookup: {}", msg),
            Self::NoUser => write!(f, "No user found for address"),
        }
    }
}

impl std::error::Error for WhoisError {}

/// Resolves a tailnet address to its owner.
#[async_trait]
pub trait WhoisLookup: Send + Sync {
    async fn whois(&self, ip: IpAddr) -> Result<WhoisIdentity, WhoisError>;
}

#[derive(Debug, Deserialize)]
struct WhoisResponse {
    #[serde(rename = "UserProfile")]
    user_profile: Option<WhoisUserProfile>,
}

#[derive(Debug, Deserialize)]
struct WhoisUserProfile {
    #[serde(rename = "LoginName")]
    login_name: Option<String>,
    #[serde(rename = "DisplayName")]
    display_name: Option<String>,
}

/// Parse `tailscale whois --json` output.
pub fn parse_whois_json(raw: &[u8]) -> Result<WhoisIdentity, WhoisError> {
    let response: WhoisResponse =
        serde_json::from_slice(raw).map_err(|e| WhoisError::Parse(e.to_string()))?;

    let profile = response.user_profile.ok_or(WhoisError::NoUser)?;
    let login = profile
        .login_name
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or(WhoisError::NoUser)?;

    Ok(WhoisIdentity {
        login: UserLogin::new(login),
        display_name: profile.display_name.filter(|n| !n.trim().is_empty()),
    })
}

/// Lookup backed by the `tailscale whois` command.
#[derive(Debug, Clone)]
pub struct TailscaleCliWhois {
    binary: String,
    timeout: Duration,
}

impl Default for TailscaleCliWhois {
    fn default() -> Self {
        Self::new("tailscale", DEFAULT_WHOIS_TIMEOUT)
    }
}

impl TailscaleCliWhois {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl WhoisLookup for TailscaleCliWhois {
    async fn whois(&self, ip: IpAddr) -> Result<WhoisIdentity, WhoisError> {
        let output = Command::new(&self.binary)
            .arg("whois")
            .arg("--json")
            .arg(ip.to_string())
            .kill_on_drop(true)
            .output();

        // kill_on_drop reaps the child if the timeout fires first.
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| WhoisError::Timeout(self.timeout))?
            .map_err(|e| WhoisError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WhoisError::CommandFailed(format!(
                "{} ({})",
                output.status, stderr
            )));
        }

        parse_whois_json(&output.stdout)
    }
}

#[derive(Clone)]
struct CachedIdentity {
    identity: WhoisIdentity,
    fetched_at: Instant,
}

/// TTL cache in front of another lookup. Only successes are cached.
pub struct CachedWhois<L> {
    inner: L,
    ttl: Duration,
    entries: RwLock<HashMap<IpAddr, CachedIdentity>>,
}

impl<L: WhoisLookup> CachedWhois<L> {
    pub fn new(inner: L, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of cached identities, including expired ones not yet replaced.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl<L: WhoisLookup> WhoisLookup for CachedWhois<L> {
    async fn whois(&self, ip: IpAddr) -> Result<WhoisIdentity, WhoisError> {
        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(&ip)
                && cached.fetched_at.elapsed() < self.ttl
            {
                return Ok(cached.identity.clone());
            }
        }

        let identity = self.inner.whois(ip).await?;
        debug!("Cached tailnet identity {} for {}", identity.login, ip);

        let mut entries = self.entries.write().await;
        // Drop stale entries while we hold the write lock.
        entries.retain(|_, cached| cached.fetched_at.elapsed() < self.ttl);
        entries.insert(
            ip,
            CachedIdentity {
                identity: identity.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(identity)
    }
}
