use serde::Deserialize;
use serde_json::Value;
use std::{
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use crate::auth::AuthMode;
use crate::ratelimit::RateLimitDefaults;

pub const DEFAULT_BIND: &str = "127.0.0.1:18789";

/// Top-level gateway configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub rate_limits: RateLimitDefaults,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Peers allowed to supply `X-Forwarded-For` / `X-Real-IP`.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
    #[serde(default)]
    pub tailscale: TailscaleSettings,
    #[serde(default)]
    pub auth: AuthSettings,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            trusted_proxies: Vec::new(),
            tailscale: TailscaleSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailscaleMode {
    #[default]
    Off,
    Serve,
    Funnel,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TailscaleSettings {
    #[serde(default)]
    pub mode: TailscaleMode,
}

/// Raw `gateway.auth` section. Every field is optional; the policy
/// resolver fills in defaults and environment fallbacks.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    #[serde(default)]
    pub mode: Option<AuthMode>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub allow_tailscale: Option<bool>,
    #[serde(default)]
    pub trust_localhost: Option<bool>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("GATEWAY_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("gateway-guard").join("gateway.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("gateway.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

pub(crate) fn expand_env_vars(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            if !closed {
                // Unterminated reference, keep the text as written.
                out.push_str("${");
                out.push_str(&name);
            } else if let Some(val) = lookup(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_value(value: &mut Value, lookup: &impl Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => *s = expand_env_vars(s, lookup),
        Value::Array(items) => items.iter_mut().for_each(|v| expand_value(v, lookup)),
        Value::Object(map) => map.values_mut().for_each(|v| expand_value(v, lookup)),
        _ => {}
    }
}

impl GatewayConfig {
    /// Parse a config document, expanding `${VAR}` references in every string.
    pub fn from_json_str(
        raw: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut value: Value = serde_json::from_str(raw)?;
        expand_value(&mut value, &lookup);
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Could not read {}: {}", path.display(), e))?;
        Self::from_json_str(&raw, |name| env::var(name).ok())
    }
}

/// Load the gateway configuration.
///
/// An explicit path must exist. Without one, the usual locations are
/// searched and built-in defaults are used when none is present.
pub fn load_gateway_config(explicit: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    if let Some(path) = explicit {
        return GatewayConfig::from_file(path);
    }

    match resolve_config_path() {
        Some(path) => {
            tracing::info!("Loading gateway config from {}", path.display());
            GatewayConfig::from_file(&path)
        }
        None => {
            tracing::info!("No gateway config found, using defaults");
            Ok(GatewayConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_expand_env_vars() {
        let lookup = lookup_from(&[("SECRET", "s3cr3t")]);
        assert_eq!(expand_env_vars("${SECRET}", &lookup), "s3cr3t");
        assert_eq!(expand_env_vars("pre-${SECRET}-post", &lookup), "pre-s3cr3t-post");
        assert_eq!(expand_env_vars("${MISSING}", &lookup), "${MISSING}");
        assert_eq!(expand_env_vars("$plain", &lookup), "$plain");
        assert_eq!(expand_env_vars("pa${ss", &lookup), "pa${ss");
        assert_eq!(expand_env_vars("${SECRET", &lookup), "${SECRET");
        assert_eq!(expand_env_vars("${SECRET}${", &lookup), "s3cr3t${");
    }

    #[test]
    fn test_defaults_when_empty() {
        let cfg = GatewayConfig::from_json_str("{}", |_| None).unwrap();
        assert_eq!(cfg.gateway.bind, DEFAULT_BIND);
        assert!(cfg.gateway.trusted_proxies.is_empty());
        assert_eq!(cfg.gateway.tailscale.mode, TailscaleMode::Off);
        assert!(cfg.gateway.auth.mode.is_none());
        assert!(cfg.gateway.auth.allowed_hosts.is_empty());
    }

    #[test]
    fn test_full_document() {
        let raw = r#"{
            "gateway": {
                "bind": "0.0.0.0:9000",
                "trustedProxies": ["10.0.0.2", "::1"],
                "tailscale": { "mode": "serve" },
                "auth": {
                    "mode": "password",
                    "password": "${GW_PASS}",
                    "allowTailscale": false,
                    "trustLocalhost": true,
                    "allowedHosts": ["gw.example.ts.net"]
                }
            },
            "rateLimits": {
                "providers": {
                    "discord": {
                        "dm": { "maxRequests": 2, "windowMs": 500, "burstSize": 1, "refillRate": 0.5 }
                    }
                }
            }
        }"#;

        let cfg = GatewayConfig::from_json_str(raw, lookup_from(&[("GW_PASS", "hunter2")]))
            .unwrap();
        assert_eq!(cfg.gateway.bind, "0.0.0.0:9000");
        assert_eq!(cfg.gateway.trusted_proxies.len(), 2);
        assert_eq!(cfg.gateway.tailscale.mode, TailscaleMode::Serve);
        assert_eq!(cfg.gateway.auth.mode, Some(AuthMode::Password));
        assert_eq!(cfg.gateway.auth.password.as_deref(), Some("hunter2"));
        assert_eq!(cfg.gateway.auth.allow_tailscale, Some(false));
        assert_eq!(cfg.gateway.auth.trust_localhost, Some(true));

        let dm = &cfg.rate_limits.providers["discord"].dm;
        assert_eq!(dm.max_requests, 2);
        assert_eq!(dm.window_ms, 500);
        assert_eq!(dm.burst_size, 1);
    }

    #[test]
    fn test_invalid_proxy_address_is_rejected() {
        let raw = r#"{ "gateway": { "trustedProxies": ["not-an-ip"] } }"#;
        assert!(GatewayConfig::from_json_str(raw, |_| None).is_err());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "gateway": {{ "auth": {{ "mode": "token" }} }} }}"#).unwrap();

        let cfg = load_gateway_config(Some(file.path())).unwrap();
        assert_eq!(cfg.gateway.auth.mode, Some(AuthMode::Token));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(load_gateway_config(Some(&missing)).is_err());
    }
}
