//! Per-account circuit breaker.
//!
//! Closed → Open once consecutive failures reach the threshold; Open → Closed
//! when a check finds the cooldown deadline has passed, or on any success.
//! There is no half-open trial send and no background timer: healing happens
//! lazily inside `is_circuit_open`.
//!
//! The durable state lives in the [`AccountStore`]. A worker may inject a
//! short-TTL [`CircuitCache`] to avoid a store read per check; every mutation
//! writes through to the store and refreshes the cache with the store's answer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use drip_core::config::CircuitBreakerConfig;
use drip_core::DripResult;

use crate::account::{AccountStore, CircuitState};

struct CacheEntry {
    state: CircuitState,
    inserted_at: Instant,
}

/// Worker-scoped cache of circuit state.
pub struct CircuitCache {
    store: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl CircuitCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            store: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Returns None if expired or missing.
    pub fn get(&self, account_id: &str) -> Option<CircuitState> {
        let entry = self.store.get(account_id)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(account_id);
            return None;
        }
        Some(entry.state.clone())
    }

    pub fn put(&self, account_id: &str, state: CircuitState) {
        self.store.insert(
            account_id.to_string(),
            CacheEntry {
                state,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, account_id: &str) {
        self.store.remove(account_id);
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

pub struct CircuitBreaker {
    store: Arc<dyn AccountStore>,
    config: CircuitBreakerConfig,
    cache: Option<Arc<CircuitCache>>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn AccountStore>, config: CircuitBreakerConfig) -> Self {
        Self {
            store,
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CircuitCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state as seen by this worker. Unknown accounts read as closed.
    pub fn state(&self, account_id: &str) -> CircuitState {
        if let Some(state) = self.cache.as_ref().and_then(|c| c.get(account_id)) {
            return state;
        }
        let state = self.store.circuit_state(account_id).unwrap_or_default();
        self.remember(account_id, &state);
        state
    }

    pub fn is_circuit_open(&self, account_id: &str, now: DateTime<Utc>) -> bool {
        let state = self.state(account_id);
        if !state.is_open {
            return false;
        }
        if state.blocks_at(now) {
            return true;
        }

        match self.store.heal_if_expired(account_id, now) {
            Ok(healed) => {
                if !healed.is_open {
                    info!(account_id = %account_id, "Circuit cooldown elapsed, account healed");
                    metrics::counter!("delivery.circuit_healed").increment(1);
                }
                let open = healed.blocks_at(now);
                self.remember(account_id, &healed);
                open
            }
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Failed to heal circuit");
                false
            }
        }
    }

    pub fn record_success(&self, account_id: &str) -> DripResult<CircuitState> {
        let state = self.store.record_success(account_id)?;
        self.remember(account_id, &state);
        Ok(state)
    }

    pub fn record_failure(&self, account_id: &str, now: DateTime<Utc>) -> DripResult<CircuitState> {
        let open_until = now + chrono::Duration::seconds(self.config.cooldown_secs);
        let was_open = self.state(account_id).is_open;
        let state = self
            .store
            .record_failure(account_id, self.config.failure_threshold, open_until)?;

        if state.is_open && !was_open {
            warn!(
                account_id = %account_id,
                failures = state.failures,
                open_until = ?state.open_until,
                "Circuit opened for sending account"
            );
            metrics::counter!("delivery.circuit_opened").increment(1);
        }
        self.remember(account_id, &state);
        Ok(state)
    }

    fn remember(&self, account_id: &str, state: &CircuitState) {
        if let Some(cache) = &self.cache {
            cache.put(account_id, state.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::account::{InMemoryAccountStore, ProviderKind, SendingAccount};

    fn breaker() -> (Arc<InMemoryAccountStore>, CircuitBreaker) {
        let store = Arc::new(InMemoryAccountStore::new());
        store.upsert_account(SendingAccount::new("a", "a@example.com", ProviderKind::Smtp));
        let breaker = CircuitBreaker::new(store.clone(), CircuitBreakerConfig::default());
        (store, breaker)
    }

    #[test]
    fn four_failures_keep_circuit_closed() {
        let (_, breaker) = breaker();
        let now = Utc::now();
        for _ in 0..4 {
            breaker.record_failure("a", now).unwrap();
        }
        assert!(!breaker.is_circuit_open("a", now));
        assert_eq!(breaker.state("a").failures, 4);
    }

    #[test]
    fn fifth_failure_opens_for_cooldown() {
        let (store, breaker) = breaker();
        let now = Utc::now();
        for _ in 0..5 {
            breaker.record_failure("a", now).unwrap();
        }
        assert!(breaker.is_circuit_open("a", now));
        let durable = store.circuit_state("a").unwrap();
        assert_eq!(durable.open_until, Some(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn success_resets_and_closes() {
        let (_, breaker) = breaker();
        let now = Utc::now();
        for _ in 0..5 {
            breaker.record_failure("a", now).unwrap();
        }
        let state = breaker.record_success("a").unwrap();
        assert_eq!(state.failures, 0);
        assert!(!breaker.is_circuit_open("a", now));
    }

    #[test]
    fn success_midway_resets_failure_count() {
        let (_, breaker) = breaker();
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure("a", now).unwrap();
        }
        breaker.record_success("a").unwrap();
        for _ in 0..4 {
            breaker.record_failure("a", now).unwrap();
        }
        assert!(!breaker.is_circuit_open("a", now));
    }

    #[test]
    fn heals_lazily_after_cooldown() {
        let (store, breaker) = breaker();
        let now = Utc::now();
        for _ in 0..5 {
            breaker.record_failure("a", now).unwrap();
        }
        let later = now + chrono::Duration::minutes(5);
        assert!(!breaker.is_circuit_open("a", later));
        assert!(!store.circuit_state("a").unwrap().is_open);
    }

    #[test]
    fn cache_is_written_through() {
        let store = Arc::new(InMemoryAccountStore::new());
        store.upsert_account(SendingAccount::new("a", "a@example.com", ProviderKind::Smtp));
        let cache = Arc::new(CircuitCache::new(60));
        let breaker = CircuitBreaker::new(store.clone(), CircuitBreakerConfig::default())
            .with_cache(cache.clone());

        let now = Utc::now();
        for _ in 0..5 {
            breaker.record_failure("a", now).unwrap();
        }
        assert!(cache.get("a").unwrap().is_open);
        assert!(breaker.is_circuit_open("a", now));

        // A second worker with its own cache sees the durable state.
        let other = CircuitBreaker::new(store, CircuitBreakerConfig::default())
            .with_cache(Arc::new(CircuitCache::new(60)));
        assert!(other.is_circuit_open("a", now));
    }

    #[test]
    fn unknown_account_reads_closed() {
        let (_, breaker) = breaker();
        assert!(!breaker.is_circuit_open("missing", Utc::now()));
        assert!(breaker.record_failure("missing", Utc::now()).is_err());
    }
}
