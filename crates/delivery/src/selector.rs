//! Healthy-account selection for a single send.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use drip_core::DripResult;

use crate::account::{AccountStore, SendingAccount};
use crate::circuit_breaker::CircuitBreaker;

pub struct AccountSelector {
    store: Arc<dyn AccountStore>,
    breaker: Arc<CircuitBreaker>,
}

impl AccountSelector {
    pub fn new(store: Arc<dyn AccountStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Picks the preferred healthy account, or None when every candidate is
    /// disabled, over quota, or behind an open circuit.
    ///
    /// Preference: lowest `priority`, then fewest sends today, then least
    /// recently used.
    pub fn select(&self, now: DateTime<Utc>) -> Option<SendingAccount> {
        let mut candidates: Vec<SendingAccount> = self
            .store
            .list_accounts()
            .into_iter()
            .filter(|a| a.enabled && a.has_quota(now))
            .filter(|a| {
                let open = self.breaker.is_circuit_open(&a.id, now);
                if open {
                    debug!(account_id = %a.id, "Skipping account with open circuit");
                }
                !open
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.sends_on(now).cmp(&b.sends_on(now)))
                .then_with(|| a.last_sent_at.cmp(&b.last_sent_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates.into_iter().next()
    }

    /// Counts a successful send against the account's daily quota.
    pub fn record_send(&self, account: &SendingAccount, now: DateTime<Utc>) -> DripResult<()> {
        let sent = self.store.increment_sent(&account.id, now)?;
        metrics::counter!("delivery.sends", "account" => account.id.clone()).increment(1);
        debug!(account_id = %account.id, sent_today = sent, "Recorded send");
        Ok(())
    }
}
