//! NewType wrappers for strong typing across the gateway.
//!
//! These types keep semantically different strings apart (e.g. passing a
//! channel tag where a limiter scope key is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Key that selects one rate limiter in the registry.
    ///
    /// Built from provider, account and conversation, e.g.
    /// `"telegram:default:global"`, `"telegram:default:group:-100123"` or
    /// `"telegram:default:dm:42"`.
    ScopeKey
);

newtype_string!(
    /// Channel a limiter belongs to (usually the provider name).
    ///
    /// Used only to group metrics; it plays no part in admission.
    ChannelTag
);

newtype_string!(
    /// Login name of an operator, as reported by the identity lookup or
    /// taken from the identity headers.
    UserLogin
);

impl ScopeKey {
    /// Scope shared by every conversation of one provider account.
    pub fn global(provider: &str, account: &str) -> Self {
        Self(format!("{}:{}:global", provider, account))
    }

    /// Scope for a single group conversation.
    pub fn group(provider: &str, account: &str, chat_id: &str) -> Self {
        Self(format!("{}:{}:group:{}", provider, account, chat_id))
    }

    /// Scope for a single direct conversation.
    pub fn dm(provider: &str, account: &str, chat_id: &str) -> Self {
        Self(format!("{}:{}:dm:{}", provider, account, chat_id))
    }

    /// Provider segment of the key (text before the first `:`).
    pub fn provider(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl UserLogin {
    /// Case-insensitive comparison; login names are not case-sensitive.
    pub fn matches(&self, other: &str) -> bool {
        self.0.trim().to_lowercase() == other.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_builders() {
        assert_eq!(
            ScopeKey::global("telegram", "default").as_str(),
            "telegram:default:global"
        );
        assert_eq!(
            ScopeKey::group("telegram", "default", "-100123").as_str(),
            "telegram:default:group:-100123"
        );
        assert_eq!(
            ScopeKey::dm("discord", "bot", "42").as_str(),
            "discord:bot:dm:42"
        );
    }

    #[test]
    fn test_scope_key_provider() {
        assert_eq!(ScopeKey::dm("slack", "acme", "U1").provider(), "slack");
        assert_eq!(ScopeKey::new("plain").provider(), "plain");
    }

    #[test]
    fn test_scope_key_serde() {
        let key = ScopeKey::global("telegram", "default");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"telegram:default:global\"");

        let parsed: ScopeKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_user_login_matches_case_insensitively() {
        let login = UserLogin::new("Alice@Example.com");
        assert!(login.matches("alice@example.com"));
        assert!(login.matches(" ALICE@EXAMPLE.COM "));
        assert!(!login.matches("bob@example.com"));

        let login = UserLogin::new("ÉLODIE@Exemple.fr");
        assert!(login.matches("élodie@exemple.fr"));
        assert!(!login.matches("elodie@exemple.fr"));
    }

    #[test]
    fn test_type_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(ChannelTag::new("telegram"));
        set.insert(ChannelTag::new("discord"));

        assert!(set.contains("telegram"));
        assert!(!set.contains("slack"));
    }

    #[test]
    fn test_borrow() {
        use std::borrow::Borrow;
        let key = ScopeKey::new("a:b:global");
        let s: &str = key.borrow();
        assert_eq!(s, "a:b:global");
    }
}
