//! Effective authentication policy, resolved once from configuration and
//! environment fallbacks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{AuthSettings, TailscaleMode};

/// Host names that always identify the local machine.
pub const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Token environment variables, current name first.
pub const TOKEN_ENV_VARS: [&str; 2] = ["CLAWDBOT_GATEWAY_TOKEN", "CLAWDIS_GATEWAY_TOKEN"];

/// Password environment variables, current name first.
pub const PASSWORD_ENV_VARS: [&str; 2] = ["CLAWDBOT_GATEWAY_PASSWORD", "CLAWDIS_GATEWAY_PASSWORD"];

/// Which shared secret a client must present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Token,
    Password,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Password => "password",
        }
    }
}

/// Immutable authentication policy shared by every connection handler.
#[derive(Clone)]
pub struct ResolvedAuthPolicy {
    mode: AuthMode,
    token: Option<String>,
    password: Option<String>,
    allow_tailscale_identity: bool,
    trust_localhost: bool,
    allowed_hosts: Vec<String>,
}

impl ResolvedAuthPolicy {
    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn allow_tailscale_identity(&self) -> bool {
        self.allow_tailscale_identity
    }

    pub fn trust_localhost(&self) -> bool {
        self.trust_localhost
    }

    /// Allowed `Host` values: the loopback literals followed by configured entries.
    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }
}

// Secrets never reach logs through Debug.
impl fmt::Debug for ResolvedAuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAuthPolicy")
            .field("mode", &self.mode)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("allow_tailscale_identity", &self.allow_tailscale_identity)
            .field("trust_localhost", &self.trust_localhost)
            .field("allowed_hosts", &self.allowed_hosts)
            .finish()
    }
}

/// Startup configuration errors. Fatal: the gateway must not listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Token mode without a token and without Tailscale identity as fallback.
    MissingToken,
    /// Password mode without a password.
    MissingPassword,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingToken => write!(
                f,
                "gateway auth mode is token but no token is configured (set gateway.auth.token or {})",
                TOKEN_ENV_VARS[0]
            ),
            Self::MissingPassword => write!(
                f,
                "gateway auth mode is password but no password is configured (set gateway.auth.password or {})",
                PASSWORD_ENV_VARS[0]
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn non_empty(value: Option<&str>) -> Option<String> {
    // Whitespace-only counts as unset; anything else is kept verbatim.
    value
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
}

fn resolve_secret(
    configured: Option<&str>,
    env_names: &[&str],
    env: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    non_empty(configured).or_else(|| {
        env_names
            .iter()
            .find_map(|name| non_empty(env(name).as_deref()))
    })
}

/// Build the effective policy.
///
/// Secrets come from config first, then from [`TOKEN_ENV_VARS`] /
/// [`PASSWORD_ENV_VARS`] in order. `env` is injected so resolution stays
/// testable; the binary passes `std::env::var`.
pub fn resolve_auth_policy(
    settings: &AuthSettings,
    tailscale_mode: TailscaleMode,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedAuthPolicy {
    let token = resolve_secret(settings.token.as_deref(), &TOKEN_ENV_VARS, &env);
    let password = resolve_secret(settings.password.as_deref(), &PASSWORD_ENV_VARS, &env);

    let mode = settings.mode.unwrap_or(if password.is_some() {
        AuthMode::Password
    } else {
        AuthMode::Token
    });

    let allow_tailscale_identity = settings
        .allow_tailscale
        .unwrap_or(tailscale_mode == TailscaleMode::Serve && mode != AuthMode::Password);

    let mut allowed_hosts: Vec<String> = LOOPBACK_HOSTS.iter().map(|h| h.to_string()).collect();
    for host in &settings.allowed_hosts {
        let host = host.trim().to_ascii_lowercase();
        if !host.is_empty() && !allowed_hosts.contains(&host) {
            allowed_hosts.push(host);
        }
    }

    ResolvedAuthPolicy {
        mode,
        token,
        password,
        allow_tailscale_identity,
        trust_localhost: settings.trust_localhost.unwrap_or(false),
        allowed_hosts,
    }
}

/// Refuse to start with a policy that no client could ever satisfy.
pub fn assert_configured(policy: &ResolvedAuthPolicy) -> Result<(), ConfigError> {
    match policy.mode {
        AuthMode::Token if policy.token.is_none() && !policy.allow_tailscale_identity => {
            Err(ConfigError::MissingToken)
        }
        AuthMode::Password if policy.password.is_none() => Err(ConfigError::MissingPassword),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_to_token_mode() {
        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Off, no_env);
        assert_eq!(policy.mode(), AuthMode::Token);
        assert!(policy.token().is_none());
        assert!(!policy.allow_tailscale_identity());
        assert!(!policy.trust_localhost());
        assert_eq!(policy.allowed_hosts(), ["localhost", "127.0.0.1", "::1"]);
    }

    #[test]
    fn test_password_presence_selects_password_mode() {
        let settings = AuthSettings {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let policy = resolve_auth_policy(&settings, TailscaleMode::Serve, no_env);
        assert_eq!(policy.mode(), AuthMode::Password);
        // Serve mode does not imply Tailscale identity for password auth.
        assert!(!policy.allow_tailscale_identity());
    }

    #[test]
    fn test_serve_mode_enables_tailscale_for_token() {
        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Serve, no_env);
        assert!(policy.allow_tailscale_identity());

        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Funnel, no_env);
        assert!(!policy.allow_tailscale_identity());
    }

    #[test]
    fn test_explicit_tailscale_setting_wins() {
        let settings = AuthSettings {
            allow_tailscale: Some(false),
            ..Default::default()
        };
        let policy = resolve_auth_policy(&settings, TailscaleMode::Serve, no_env);
        assert!(!policy.allow_tailscale_identity());
    }

    #[test]
    fn test_config_secret_beats_environment() {
        let settings = AuthSettings {
            token: Some("from-config".to_string()),
            ..Default::default()
        };
        let env = env_from(&[("CLAWDBOT_GATEWAY_TOKEN", "from-env")]);
        let policy = resolve_auth_policy(&settings, TailscaleMode::Off, env);
        assert_eq!(policy.token(), Some("from-config"));
    }

    #[test]
    fn test_environment_generations_in_order() {
        let env = env_from(&[
            ("CLAWDBOT_GATEWAY_TOKEN", "current"),
            ("CLAWDIS_GATEWAY_TOKEN", "legacy"),
        ]);
        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Off, env);
        assert_eq!(policy.token(), Some("current"));

        let env = env_from(&[
            ("CLAWDBOT_GATEWAY_TOKEN", "  "),
            ("CLAWDIS_GATEWAY_TOKEN", "legacy"),
        ]);
        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Off, env);
        assert_eq!(policy.token(), Some("legacy"));

        let env = env_from(&[("CLAWDIS_GATEWAY_PASSWORD", "old-pass")]);
        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Off, env);
        assert_eq!(policy.mode(), AuthMode::Password);
        assert_eq!(policy.password(), Some("old-pass"));
    }

    #[test]
    fn test_secrets_are_stored_verbatim() {
        let settings = AuthSettings {
            token: Some(" pad ".to_string()),
            ..Default::default()
        };
        let policy = resolve_auth_policy(&settings, TailscaleMode::Off, no_env);
        assert_eq!(policy.token(), Some(" pad "));

        let env = env_from(&[("CLAWDBOT_GATEWAY_PASSWORD", "pass\n")]);
        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Off, env);
        assert_eq!(policy.password(), Some("pass\n"));
    }

    #[test]
    fn test_allowed_hosts_always_include_loopback() {
        let settings = AuthSettings {
            allowed_hosts: vec![
                "Gateway.Example.ts.net".to_string(),
                "localhost".to_string(),
                " ".to_string(),
            ],
            ..Default::default()
        };
        let policy = resolve_auth_policy(&settings, TailscaleMode::Off, no_env);
        assert_eq!(
            policy.allowed_hosts(),
            ["localhost", "127.0.0.1", "::1", "gateway.example.ts.net"]
        );
    }

    #[test]
    fn test_assert_configured() {
        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Off, no_env);
        assert_eq!(assert_configured(&policy), Err(ConfigError::MissingToken));

        // Tailscale identity is an acceptable fallback for a missing token.
        let policy = resolve_auth_policy(&AuthSettings::default(), TailscaleMode::Serve, no_env);
        assert!(assert_configured(&policy).is_ok());

        let settings = AuthSettings {
            mode: Some(AuthMode::Password),
            ..Default::default()
        };
        let policy = resolve_auth_policy(&settings, TailscaleMode::Serve, no_env);
        assert_eq!(assert_configured(&policy), Err(ConfigError::MissingPassword));

        let settings = AuthSettings {
            token: Some("t".to_string()),
            ..Default::default()
        };
        let policy = resolve_auth_policy(&settings, TailscaleMode::Off, no_env);
        assert!(assert_configured(&policy).is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let settings = AuthSettings {
            token: Some("super-secret".to_string()),
            ..Default::default()
        };
        let policy = resolve_auth_policy(&settings, TailscaleMode::Off, no_env);
        let debug = format!("{:?}", policy);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
