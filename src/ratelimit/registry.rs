//! Limiter registry: one facade per scope key, created on first use.
//!
//! The registry is an ordinary value owned by the gateway and handed to
//! whatever needs outbound admission control. Per-provider tuning comes in
//! as [`RateLimitDefaults`]; nothing provider-specific is compiled in.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ratelimit::limiter::{LimiterOptions, LimiterSnapshot, RateLimiter, TransitionObserver};
use crate::ratelimit::metrics::AggregatedMetrics;
use crate::types::ScopeKey;

/// Limits for the three scopes of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderLimits {
    /// Ceiling across every conversation of an account.
    pub global: LimiterOptions,
    pub group: LimiterOptions,
    pub dm: LimiterOptions,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            global: LimiterOptions {
                max_requests: 30,
                window_ms: 1_000,
                burst_size: 30,
                refill_rate: 30.0,
                ..Default::default()
            },
            group: LimiterOptions {
                max_requests: 20,
                window_ms: 60_000,
                burst_size: 3,
                refill_rate: 0.33,
                ..Default::default()
            },
            dm: LimiterOptions {
                max_requests: 60,
                window_ms: 60_000,
                burst_size: 5,
                refill_rate: 1.0,
                ..Default::default()
            },
        }
    }
}

impl ProviderLimits {
    pub fn for_scope(&self, scope: &ConversationScope) -> &LimiterOptions {
        match scope {
            ConversationScope::Global => &self.global,
            ConversationScope::Group(_) => &self.group,
            ConversationScope::Dm(_) => &self.dm,
        }
    }
}

/// `rateLimits` section of the gateway config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitDefaults {
    /// Used for providers without their own entry.
    pub fallback: ProviderLimits,
    pub providers: BTreeMap<String, ProviderLimits>,
}

impl RateLimitDefaults {
    pub fn for_provider(&self, provider: &str) -> &ProviderLimits {
        self.providers.get(provider).unwrap_or(&self.fallback)
    }

    pub fn options_for(&self, provider: &str, scope: &ConversationScope) -> LimiterOptions {
        self.for_provider(provider).for_scope(scope).clone()
    }
}

/// Which conversation an outbound call belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationScope {
    Global,
    Group(String),
    Dm(String),
}

impl ConversationScope {
    pub fn key(&self, provider: &str, account: &str) -> ScopeKey {
        match self {
            Self::Global => ScopeKey::global(provider, account),
            Self::Group(chat_id) => ScopeKey::group(provider, account, chat_id),
            Self::Dm(chat_id) => ScopeKey::dm(provider, account, chat_id),
        }
    }
}

pub struct LimiterRegistry {
    defaults: RateLimitDefaults,
    limiters: RwLock<HashMap<ScopeKey, Arc<RateLimiter>>>,
    observer: Option<TransitionObserver>,
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimitDefaults::default())
    }
}

impl LimiterRegistry {
    pub fn new(defaults: RateLimitDefaults) -> Self {
        Self {
            defaults,
            limiters: RwLock::new(HashMap::new()),
            observer: None,
        }
    }

    /// Observer attached to every limiter created from now on.
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn defaults(&self) -> &RateLimitDefaults {
        &self.defaults
    }

    /// Return the limiter for `key`, creating it with `options` if absent.
    ///
    /// `options` is ignored when the limiter already exists.
    pub fn get_or_create(&self, key: &ScopeKey, options: LimiterOptions) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.read().get(key) {
            return limiter.clone();
        }

        let mut limiters = self.limiters.write();
        limiters
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Creating rate limiter for {}", key);
                let limiter = RateLimiter::new(key.clone(), options);
                let limiter = match &self.observer {
                    Some(observer) => limiter.with_observer(observer.clone()),
                    None => limiter,
                };
                Arc::new(limiter)
            })
            .clone()
    }

    /// Limiter for a conversation, tuned from the provider table.
    pub fn for_conversation(
        &self,
        provider: &str,
        account: &str,
        scope: &ConversationScope,
    ) -> Arc<RateLimiter> {
        let key = scope.key(provider, account);
        self.get_or_create(&key, self.defaults.options_for(provider, scope))
    }

    pub fn get(&self, key: &ScopeKey) -> Option<Arc<RateLimiter>> {
        self.limiters.read().get(key).cloned()
    }

    /// All limiters, ordered by scope key.
    pub fn get_all(&self) -> Vec<Arc<RateLimiter>> {
        let mut all: Vec<_> = self.limiters.read().values().cloned().collect();
        all.sort_by(|a, b| a.scope().cmp(b.scope()));
        all
    }

    pub fn snapshots(&self) -> Vec<LimiterSnapshot> {
        self.get_all().iter().map(|l| l.get_state()).collect()
    }

    /// Sum of every limiter's counters, grouped by channel.
    pub fn aggregated_metrics(&self) -> AggregatedMetrics {
        let mut aggregated = AggregatedMetrics::default();
        for limiter in self.get_all() {
            aggregated.add(limiter.channel().as_str(), &limiter.get_metrics());
        }
        aggregated
    }

    /// Forget every limiter. Handles already given out keep working but
    /// are no longer shared with new callers.
    pub fn clear(&self) {
        let mut limiters = self.limiters.write();
        debug!("Clearing {} rate limiters", limiters.len());
        limiters.clear();
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{CircuitState, CircuitTransition, LimiterMetrics};
    use parking_lot::Mutex;

    #[test]
    fn test_same_key_same_instance() {
        let registry = LimiterRegistry::default();
        let key = ScopeKey::global("telegram", "default");

        let a = registry.get_or_create(&key, LimiterOptions::default());
        let b = registry.get_or_create(
            &key,
            LimiterOptions {
                max_requests: 1,
                ..Default::default()
            },
        );

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.options().max_requests, 30);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&key).unwrap(), &a));
        assert!(registry.get(&ScopeKey::new("missing")).is_none());
    }

    #[tokio::test]
    async fn test_aggregate_is_exact_sum() {
        let registry = LimiterRegistry::default();
        let tg = registry.for_conversation("telegram", "default", &ConversationScope::Global);
        let tg_dm = registry.for_conversation("telegram", "default", &ConversationScope::Dm("42".into()));
        let dc = registry.for_conversation("discord", "bot", &ConversationScope::Group("g1".into()));
        let slack = registry.get_or_create(
            &ScopeKey::global("slack", "acme"),
            LimiterOptions {
                failure_threshold: 1,
                ..Default::default()
            },
        );

        for _ in 0..4 {
            tg.try_acquire();
        }
        for _ in 0..7 {
            tg_dm.try_acquire();
        }
        // Group burst is 3 and its window allows 20; 25 attempts overflow it.
        for _ in 0..25 {
            dc.try_acquire();
        }
        // One admitted call fails and trips the breaker; the rest bounce off it.
        assert!(slack.try_acquire().allowed);
        slack.record_failure();
        for _ in 0..5 {
            assert!(!slack.try_acquire().allowed);
        }

        let aggregated = registry.aggregated_metrics();
        let all = registry.get_all();
        assert_eq!(aggregated.limiter_count, 4);
        assert_eq!(all.len(), 4);

        let each: Vec<LimiterMetrics> = all.iter().map(|l| l.get_metrics()).collect();
        let sum = |field: fn(&LimiterMetrics) -> u64| each.iter().map(field).sum::<u64>();
        let totals = &aggregated.totals;
        assert_eq!(totals.total_requests, sum(|m| m.total_requests));
        assert_eq!(totals.allowed_requests, sum(|m| m.allowed_requests));
        assert_eq!(totals.rejected_requests, sum(|m| m.rejected_requests));
        assert_eq!(totals.circuit_rejections, sum(|m| m.circuit_rejections));
        assert_eq!(totals.circuit_state_changes, sum(|m| m.circuit_state_changes));

        let weight = sum(|m| m.rate_limited_requests()) as f64;
        let weighted = each
            .iter()
            .map(|m| m.average_wait_ms * m.rate_limited_requests() as f64)
            .sum::<f64>();
        assert!(weight > 0.0);
        assert!((totals.average_wait_ms - weighted / weight).abs() < 1e-6);
        assert!(totals.average_wait_ms > 0.0);

        assert_eq!(totals.total_requests, 42);
        assert_eq!(totals.circuit_rejections, 5);
        assert_eq!(totals.circuit_state_changes, 1);
        assert!(totals.rejected_requests > totals.circuit_rejections);

        assert_eq!(aggregated.by_channel["telegram"].total_requests, 11);
        assert_eq!(aggregated.by_channel["discord"].total_requests, 25);
        let by_slack = &aggregated.by_channel["slack"];
        assert_eq!(by_slack.total_requests, 6);
        assert_eq!(by_slack.allowed_requests, 1);
        assert_eq!(by_slack.circuit_rejections, 5);
        assert_eq!(by_slack.average_wait_ms, 0.0);
        assert_eq!(slack.circuit_state(), CircuitState::Open);
    }

    #[test]
    fn test_clear_yields_fresh_instance() {
        let registry = LimiterRegistry::default();
        let key = ScopeKey::dm("slack", "acme", "U1");

        let before = registry.get_or_create(&key, LimiterOptions::default());
        before.try_acquire();
        before.record_failure();
        assert_eq!(before.get_metrics().total_requests, 1);

        registry.clear();
        assert!(registry.is_empty());

        let after = registry.get_or_create(&key, LimiterOptions::default());
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.get_metrics(), LimiterMetrics::default());
        assert_eq!(after.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_provider_table_selects_options() {
        let mut defaults = RateLimitDefaults::default();
        defaults.providers.insert(
            "discord".to_string(),
            ProviderLimits {
                dm: LimiterOptions {
                    max_requests: 2,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let registry = LimiterRegistry::new(defaults);

        let dm = registry.for_conversation("discord", "bot", &ConversationScope::Dm("7".into()));
        assert_eq!(dm.scope().as_str(), "discord:bot:dm:7");
        assert_eq!(dm.options().max_requests, 2);
        assert_eq!(dm.channel().as_str(), "discord");

        let other = registry.for_conversation("telegram", "default", &ConversationScope::Dm("7".into()));
        assert_eq!(other.options().max_requests, 60);
    }

    #[test]
    fn test_get_all_is_sorted() {
        let registry = LimiterRegistry::default();
        for key in ["b:x:global", "a:x:global", "c:x:global"] {
            registry.get_or_create(&ScopeKey::new(key), LimiterOptions::default());
        }

        let keys: Vec<_> = registry
            .get_all()
            .iter()
            .map(|l| l.scope().to_string())
            .collect();
        assert_eq!(keys, vec!["a:x:global", "b:x:global", "c:x:global"]);
        assert_eq!(registry.snapshots().len(), 3);
    }

    #[test]
    fn test_observer_is_attached_to_new_limiters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let registry = LimiterRegistry::default().with_observer(Arc::new(move |t: &CircuitTransition| {
            sink.lock().push(t.clone());
        }));

        let limiter = registry.get_or_create(
            &ScopeKey::global("signal", "me"),
            LimiterOptions {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        limiter.record_failure();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].scope.as_str(), "signal:me:global");
        assert_eq!(seen[0].to, CircuitState::Open);
    }

    #[test]
    fn test_defaults_deserialize() {
        let raw = r#"{
            "fallback": { "global": { "maxRequests": 100 } },
            "providers": { "telegram": { "group": { "burstSize": 1 } } }
        }"#;
        let defaults: RateLimitDefaults = serde_json::from_str(raw).unwrap();

        assert_eq!(defaults.fallback.global.max_requests, 100);
        // Sibling scopes keep their built-in limits.
        assert_eq!(defaults.fallback.dm.max_requests, 60);
        assert_eq!(defaults.for_provider("telegram").group.burst_size, 1);
        assert_eq!(defaults.for_provider("whatsapp").group.burst_size, 3);
    }
}
