//! Connection authorization.
//!
//! [`authorize`] never fails: every outcome is an [`AuthDecision`]. Rejection
//! reasons are for internal logs only; clients see a generic rejection.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::auth::policy::{AuthMode, ResolvedAuthPolicy};
use crate::auth::request::{RequestFacts, is_local_direct_request};
use crate::auth::whois::WhoisLookup;
use crate::types::UserLogin;

/// How a connection proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Token,
    Password,
    Tailscale,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Password => "password",
            Self::Tailscale => "tailscale",
        }
    }
}

/// Internal reason for a rejected connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    TokenMissingConfig,
    TokenMissing,
    TokenMismatch,
    PasswordMissingConfig,
    PasswordMissing,
    PasswordMismatch,
    TailscaleUserMissing,
    TailscaleProxyMissing,
    TailscaleWhoisFailed,
    TailscaleUserMismatch,
    Unauthorized,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenMissingConfig => "token_missing_config",
            Self::TokenMissing => "token_missing",
            Self::TokenMismatch => "token_mismatch",
            Self::PasswordMissingConfig => "password_missing_config",
            Self::PasswordMissing => "password_missing",
            Self::PasswordMismatch => "password_mismatch",
            Self::TailscaleUserMissing => "tailscale_user_missing",
            Self::TailscaleProxyMissing => "tailscale_proxy_missing",
            Self::TailscaleWhoisFailed => "tailscale_whois_failed",
            Self::TailscaleUserMismatch => "tailscale_user_mismatch",
            Self::Unauthorized => "unauthorized",
        }
    }

    /// What an unauthenticated party may be told, whatever the reason.
    pub fn public_message(&self) -> &'static str {
        Self::Unauthorized.as_str()
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one authorization attempt.
///
/// `ok` holds exactly when a method is present; the constructors keep the
/// two in step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthDecision {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<AuthMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserLogin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<ReasonCode>,
}

impl AuthDecision {
    pub fn admitted(method: AuthMethod, user: Option<UserLogin>) -> Self {
        Self {
            ok: true,
            method: Some(method),
            user,
            reason: None,
        }
    }

    pub fn rejected(reason: ReasonCode) -> Self {
        Self {
            ok: false,
            method: None,
            user: None,
            reason: Some(reason),
        }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn method(&self) -> Option<AuthMethod> {
        self.method
    }

    pub fn user(&self) -> Option<&UserLogin> {
        self.user.as_ref()
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        self.reason
    }
}

/// Secret presented by a connection. Transport-agnostic.
#[derive(Clone, Default)]
pub struct Credentials {
    token: Option<String>,
    password: Option<String>,
}

impl Credentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn token(value: impl Into<String>) -> Self {
        Self {
            token: Some(value.into()),
            password: None,
        }
    }

    pub fn password(value: impl Into<String>) -> Self {
        Self {
            token: None,
            password: Some(value.into()),
        }
    }

    /// A single opaque secret (e.g. an HTTP bearer value); the policy mode
    /// decides whether it is checked as token or password.
    pub fn shared(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            token: Some(value.clone()),
            password: Some(value),
        }
    }

    fn supplied_token(&self) -> Option<&str> {
        self.token.as_deref().filter(|v| !v.is_empty())
    }

    fn supplied_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Compare two secrets in constant time.
///
/// Both sides are hashed first so neither the length nor the position of
/// the first differing byte affects timing.
pub fn safe_equal(expected: &str, provided: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// Verify the Tailscale identity headers against an out-of-band lookup.
async fn verify_tailscale_user(
    facts: &RequestFacts,
    whois: &dyn WhoisLookup,
) -> Result<UserLogin, ReasonCode> {
    let claimed = facts
        .identity()
        .login
        .as_deref()
        .ok_or(ReasonCode::TailscaleUserMissing)?;

    if !facts.is_local_proxy_request() {
        return Err(ReasonCode::TailscaleProxyMissing);
    }

    let client_ip = facts
        .forwarded_client()
        .ok_or(ReasonCode::TailscaleWhoisFailed)?;

    let identity = whois.whois(client_ip).await.map_err(|e| {
        debug!("Tailscale identity lookup for {} failed: {}", client_ip, e);
        ReasonCode::TailscaleWhoisFailed
    })?;

    if !identity.login.matches(claimed) {
        debug!(
            "Tailscale identity mismatch: header claims {}, tailnet reports {}",
            claimed, identity.login
        );
        return Err(ReasonCode::TailscaleUserMismatch);
    }

    Ok(identity.login)
}

struct SecretCheck<'a> {
    configured: Option<&'a str>,
    supplied: Option<&'a str>,
    method: AuthMethod,
    missing_config: ReasonCode,
    missing: ReasonCode,
    mismatch: ReasonCode,
}

fn check_secret(check: SecretCheck<'_>, tailscale_reason: Option<ReasonCode>) -> AuthDecision {
    let Some(configured) = check.configured else {
        return AuthDecision::rejected(tailscale_reason.unwrap_or(check.missing_config));
    };
    let Some(supplied) = check.supplied else {
        return AuthDecision::rejected(tailscale_reason.unwrap_or(check.missing));
    };
    if !safe_equal(configured, supplied) {
        return AuthDecision::rejected(check.mismatch);
    }
    AuthDecision::admitted(check.method, None)
}

/// Decide whether a connection may proceed.
///
/// With Tailscale identity allowed, requests that are not local-direct try
/// the identity path first and succeed on a verified login. Otherwise the
/// policy mode selects the token or password check.
pub async fn authorize(
    policy: &ResolvedAuthPolicy,
    facts: &RequestFacts,
    credentials: &Credentials,
    whois: &dyn WhoisLookup,
) -> AuthDecision {
    let mut tailscale_reason = None;

    if policy.allow_tailscale_identity() && !is_local_direct_request(facts) {
        match verify_tailscale_user(facts, whois).await {
            Ok(login) => {
                debug!("Connection admitted via tailscale identity {}", login);
                return AuthDecision::admitted(AuthMethod::Tailscale, Some(login));
            }
            Err(reason) => tailscale_reason = Some(reason),
        }
    }

    let decision = match policy.mode() {
        AuthMode::Token => check_secret(
            SecretCheck {
                configured: policy.token(),
                supplied: credentials.supplied_token(),
                method: AuthMethod::Token,
                missing_config: ReasonCode::TokenMissingConfig,
                missing: ReasonCode::TokenMissing,
                mismatch: ReasonCode::TokenMismatch,
            },
            tailscale_reason,
        ),
        AuthMode::Password => check_secret(
            SecretCheck {
                configured: policy.password(),
                supplied: credentials.supplied_password(),
                method: AuthMethod::Password,
                missing_config: ReasonCode::PasswordMissingConfig,
                missing: ReasonCode::PasswordMissing,
                mismatch: ReasonCode::PasswordMismatch,
            },
            tailscale_reason,
        ),
    };

    match decision.reason() {
        Some(reason) => debug!(
            "Connection from {:?} rejected: {}",
            facts.client_ip(),
            reason
        ),
        None => debug!(
            "Connection from {:?} admitted via {}",
            facts.client_ip(),
            policy.mode().as_str()
        ),
    }

    decision
}
