//! Connection admission control for the control plane.
//!
//! A request is classified once into [`RequestFacts`], then checked against
//! the immutable [`ResolvedAuthPolicy`]:
//!
//! - **Token / Password**: shared secret, compared in constant time
//! - **Tailscale**: identity headers from the local serve proxy, confirmed
//!   by an out-of-band [`WhoisLookup`]
//! - **Trusted localhost**: opt-in, guarded by the DNS-rebinding checks
//!
//! ## Security Model
//!
//! - Forwarding headers are ignored unless the peer is a trusted proxy
//! - Identity headers are never sufficient on their own
//! - Rejection reasons stay internal; callers answer with a generic rejection
//!
//! ## Usage
//!
//! ```ignore
//! let policy = resolve_auth_policy(&config.gateway.auth, config.gateway.tailscale.mode, |k| std::env::var(k).ok());
//! assert_configured(&policy)?;
//!
//! let facts = RequestFacts::classify(Some(peer), &headers, &trusted_proxies);
//! let decision = authorize(&policy, &facts, &Credentials::shared(bearer), &whois).await;
//! ```

mod authorize;
mod policy;
mod request;
pub mod whois;

pub use authorize::{AuthDecision, AuthMethod, Credentials, ReasonCode, authorize, safe_equal};
pub use policy::{
    AuthMode, ConfigError, LOOPBACK_HOSTS, PASSWORD_ENV_VARS, ResolvedAuthPolicy, TOKEN_ENV_VARS,
    assert_configured, resolve_auth_policy,
};
pub use request::{
    IdentityHeaders, RequestFacts, TAILSCALE_SERVE_SUFFIX, is_local_direct_request, is_loopback,
    normalize_host, should_trust_localhost, validate_host_header,
};
pub use whois::{CachedWhois, TailscaleCliWhois, WhoisError, WhoisIdentity, WhoisLookup};
