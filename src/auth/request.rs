//! Per-request facts used by the authorizer.
//!
//! Headers are parsed once into an immutable [`RequestFacts`] value. The
//! client address only honours `X-Forwarded-For` / `X-Real-IP` when the
//! immediate peer is a configured trusted proxy.

use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;

use crate::auth::policy::{LOOPBACK_HOSTS, ResolvedAuthPolicy};

/// `Host` suffix used by Tailscale serve.
pub const TAILSCALE_SERVE_SUFFIX: &str = ".ts.net";

/// The only wildcard entry understood by the host allowlist.
pub const TAILSCALE_HOST_WILDCARD: &str = "*.ts.net";

pub const TAILSCALE_USER_LOGIN: &str = "tailscale-user-login";
pub const TAILSCALE_USER_NAME: &str = "tailscale-user-name";
pub const TAILSCALE_USER_PROFILE_PIC: &str = "tailscale-user-profile-pic";

/// Identity headers injected by the Tailscale serve proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityHeaders {
    pub login: Option<String>,
    pub name: Option<String>,
    pub profile_pic: Option<String>,
}

/// Immutable snapshot of everything the authorizer needs from one request.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    peer: Option<IpAddr>,
    peer_is_trusted_proxy: bool,
    client_ip: Option<IpAddr>,
    host: Option<String>,
    forwarded_for: Vec<String>,
    real_ip: Option<String>,
    forwarded_proto: Option<String>,
    forwarded_host: Option<String>,
    identity: IdentityHeaders,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    // Some proxies append the port.
    raw.parse::<SocketAddr>().ok().map(|addr| addr.ip())
}

/// Unwrap `::ffff:a.b.c.d` so address comparisons see the IPv4 form.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// True for `127.0.0.0/8`, `::1` and `::ffff:127.*`.
pub fn is_loopback(ip: IpAddr) -> bool {
    canonical(ip).is_loopback()
}

/// Lower-case the host and strip any port, including bracketed IPv6.
pub fn normalize_host(raw: &str) -> String {
    let host = raw.trim().to_ascii_lowercase();
    let host = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default().to_string()
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or_default().to_string()
    } else {
        host
    };
    host.trim_end_matches('.').to_string()
}

fn is_trusted(ip: IpAddr, trusted_proxies: &[IpAddr]) -> bool {
    let ip = canonical(ip);
    trusted_proxies.iter().any(|p| canonical(*p) == ip)
}

impl RequestFacts {
    /// Classify a request from its peer address and headers.
    pub fn classify(
        peer: Option<SocketAddr>,
        headers: &HeaderMap,
        trusted_proxies: &[IpAddr],
    ) -> Self {
        let peer = peer.map(|addr| canonical(addr.ip()));
        let peer_is_trusted_proxy = peer.is_some_and(|ip| is_trusted(ip, trusted_proxies));

        let forwarded_for: Vec<String> = header_str(headers, "x-forwarded-for")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let real_ip = header_str(headers, "x-real-ip");

        let client_ip = if peer_is_trusted_proxy {
            resolve_forwarded_client(&forwarded_for, real_ip.as_deref(), trusted_proxies).or(peer)
        } else {
            peer
        };

        Self {
            peer,
            peer_is_trusted_proxy,
            client_ip,
            host: header_str(headers, http::header::HOST.as_str()).map(|h| normalize_host(&h)),
            forwarded_for,
            real_ip,
            forwarded_proto: header_str(headers, "x-forwarded-proto"),
            forwarded_host: header_str(headers, "x-forwarded-host"),
            identity: IdentityHeaders {
                login: header_str(headers, TAILSCALE_USER_LOGIN),
                name: header_str(headers, TAILSCALE_USER_NAME),
                profile_pic: header_str(headers, TAILSCALE_USER_PROFILE_PIC),
            },
        }
    }

    /// Immediate socket peer.
    pub fn peer(&self) -> Option<IpAddr> {
        self.peer
    }

    pub fn peer_is_trusted_proxy(&self) -> bool {
        self.peer_is_trusted_proxy
    }

    /// Best-known client address after trusted-proxy resolution.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    /// Normalized `Host` header (lower-case, no port).
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn identity(&self) -> &IdentityHeaders {
        &self.identity
    }

    /// Left-most `X-Forwarded-For` entry, regardless of peer trust.
    pub fn forwarded_client(&self) -> Option<IpAddr> {
        self.forwarded_for.first().and_then(|raw| parse_ip(raw))
    }

    pub fn has_forwarding_headers(&self) -> bool {
        !self.forwarded_for.is_empty()
            || self.real_ip.is_some()
            || self.forwarded_proto.is_some()
            || self.forwarded_host.is_some()
    }

    /// Peer is loopback and all three proxy markers are present, which is
    /// what a request relayed by the local Tailscale serve proxy looks like.
    pub fn is_local_proxy_request(&self) -> bool {
        self.peer.is_some_and(is_loopback)
            && !self.forwarded_for.is_empty()
            && self.forwarded_proto.is_some()
            && self.forwarded_host.is_some()
    }
}

/// Walk `X-Forwarded-For` right to left and return the first hop that is
/// not itself a trusted proxy. Falls back to `X-Real-IP`.
fn resolve_forwarded_client(
    forwarded_for: &[String],
    real_ip: Option<&str>,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let hops: Vec<IpAddr> = forwarded_for.iter().filter_map(|h| parse_ip(h)).collect();
    hops.iter()
        .rev()
        .copied()
        .map(canonical)
        .find(|ip| !is_trusted(*ip, trusted_proxies))
        .or_else(|| hops.first().copied().map(canonical))
        .or_else(|| real_ip.and_then(parse_ip).map(canonical))
}

fn is_local_host(host: &str) -> bool {
    LOOPBACK_HOSTS.contains(&host) || host.ends_with(TAILSCALE_SERVE_SUFFIX)
}

/// DNS-rebinding defense: a request is "local direct" only when the
/// resolved client is loopback, the `Host` names the local machine, and any
/// forwarding headers came from a trusted proxy.
pub fn is_local_direct_request(facts: &RequestFacts) -> bool {
    let client_is_loopback = facts.client_ip.is_some_and(is_loopback);
    let host_is_local = facts.host.as_deref().is_some_and(is_local_host);
    let forwarding_ok = !facts.has_forwarding_headers() || facts.peer_is_trusted_proxy;

    client_is_loopback && host_is_local && forwarding_ok
}

/// Enforce the `Host` allowlist.
///
/// An empty allowlist admits every host. That is not recommended; the
/// resolved policy always carries the loopback names.
pub fn validate_host_header(facts: &RequestFacts, allowed_hosts: &[String]) -> bool {
    if allowed_hosts.is_empty() {
        return true;
    }
    let Some(host) = facts.host.as_deref() else {
        return false;
    };
    allowed_hosts.iter().any(|allowed| {
        allowed == host
            || (allowed == TAILSCALE_HOST_WILDCARD && host.ends_with(TAILSCALE_SERVE_SUFFIX))
    })
}

/// Localhost is only special-cased when the policy opts in and both the
/// local-direct and host-allowlist checks pass.
pub fn should_trust_localhost(policy: &ResolvedAuthPolicy, facts: &RequestFacts) -> bool {
    policy.trust_localhost()
        && is_local_direct_request(facts)
        && validate_host_header(facts, policy.allowed_hosts())
}
