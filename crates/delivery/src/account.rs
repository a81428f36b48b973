//! Sending accounts and the durable copy of their circuit state.
//!
//! Circuit mutations are expressed as conditional updates on a single account
//! record so concurrent workers never lose an increment or reopen a circuit
//! another worker already healed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use drip_core::{DripError, DripResult};

/// Transport backend an account delivers through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Smtp,
    SendGrid,
    AmazonSes,
    Mailgun,
}

/// Health of one sending account. Binary: either closed, or open until a
/// single deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub failures: u32,
    pub is_open: bool,
    pub open_until: Option<DateTime<Utc>>,
}

impl CircuitState {
    /// True while the circuit is open and its cooldown has not elapsed.
    pub fn blocks_at(&self, now: DateTime<Utc>) -> bool {
        self.is_open && self.open_until.map_or(true, |until| now < until)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingAccount {
    pub id: String,
    pub name: String,
    pub from_email: String,
    pub provider: ProviderKind,
    pub enabled: bool,
    /// Lower is preferred.
    pub priority: u32,
    pub daily_limit: u32,
    pub sent_today: u32,
    pub last_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub circuit: CircuitState,
}

impl SendingAccount {
    pub fn new(id: impl Into<String>, from_email: impl Into<String>, provider: ProviderKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            from_email: from_email.into(),
            provider,
            enabled: true,
            priority: 100,
            daily_limit: 500,
            sent_today: 0,
            last_sent_at: None,
            circuit: CircuitState::default(),
        }
    }

    /// Sends counted against today's quota; the counter is stale once the UTC day rolls over.
    pub fn sends_on(&self, now: DateTime<Utc>) -> u32 {
        match self.last_sent_at {
            Some(last) if last.date_naive() == now.date_naive() => self.sent_today,
            _ => 0,
        }
    }

    pub fn has_quota(&self, now: DateTime<Utc>) -> bool {
        self.sends_on(now) < self.daily_limit
    }
}

/// Data access for sending accounts and their circuit state.
pub trait AccountStore: Send + Sync {
    fn list_accounts(&self) -> Vec<SendingAccount>;

    fn get_account(&self, id: &str) -> Option<SendingAccount>;

    fn circuit_state(&self, id: &str) -> Option<CircuitState>;

    /// Increment failures; open the circuit with `open_until` only when the
    /// count reaches `threshold` and the circuit is not already open.
    fn record_failure(
        &self,
        id: &str,
        threshold: u32,
        open_until: DateTime<Utc>,
    ) -> DripResult<CircuitState>;

    /// Reset failures and close the circuit.
    fn record_success(&self, id: &str) -> DripResult<CircuitState>;

    /// Close the circuit only if it is open and `now` has reached its deadline.
    fn heal_if_expired(&self, id: &str, now: DateTime<Utc>) -> DripResult<CircuitState>;

    /// Count one send against the account's daily quota, returning the new count.
    fn increment_sent(&self, id: &str, now: DateTime<Utc>) -> DripResult<u32>;
}

/// Thread-safe in-memory account store backed by DashMap.
///
/// Each mutation holds the shard lock for its account for the whole
/// read-modify-write, which is the in-memory equivalent of a conditional
/// `UPDATE ... WHERE` on the account row.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<String, SendingAccount>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    pub fn upsert_account(&self, account: SendingAccount) {
        info!(account_id = %account.id, provider = ?account.provider, "Registering sending account");
        self.accounts.insert(account.id.clone(), account);
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> DripResult<()> {
        let mut entry = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| DripError::not_found("Account", id))?;
        entry.enabled = enabled;
        Ok(())
    }

    fn update<F, T>(&self, id: &str, f: F) -> DripResult<T>
    where
        F: FnOnce(&mut SendingAccount) -> T,
    {
        let mut entry = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| DripError::not_found("Account", id))?;
        Ok(f(entry.value_mut()))
    }
}

impl AccountStore for InMemoryAccountStore {
    fn list_accounts(&self) -> Vec<SendingAccount> {
        let mut accounts: Vec<SendingAccount> =
            self.accounts.iter().map(|r| r.value().clone()).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    fn get_account(&self, id: &str) -> Option<SendingAccount> {
        self.accounts.get(id).map(|r| r.value().clone())
    }

    fn circuit_state(&self, id: &str) -> Option<CircuitState> {
        self.accounts.get(id).map(|r| r.circuit.clone())
    }

    fn record_failure(
        &self,
        id: &str,
        threshold: u32,
        open_until: DateTime<Utc>,
    ) -> DripResult<CircuitState> {
        self.update(id, |account| {
            let circuit = &mut account.circuit;
            circuit.failures = circuit.failures.saturating_add(1);
            if !circuit.is_open && circuit.failures >= threshold {
                circuit.is_open = true;
                circuit.open_until = Some(open_until);
            }
            circuit.clone()
        })
    }

    fn record_success(&self, id: &str) -> DripResult<CircuitState> {
        self.update(id, |account| {
            account.circuit = CircuitState::default();
            account.circuit.clone()
        })
    }

    fn heal_if_expired(&self, id: &str, now: DateTime<Utc>) -> DripResult<CircuitState> {
        self.update(id, |account| {
            let expired = account
                .circuit
                .open_until
                .map_or(true, |until| now >= until);
            if account.circuit.is_open && expired {
                account.circuit = CircuitState::default();
            }
            account.circuit.clone()
        })
    }

    fn increment_sent(&self, id: &str, now: DateTime<Utc>) -> DripResult<u32> {
        self.update(id, |account| {
            account.sent_today = account.sends_on(now) + 1;
            account.last_sent_at = Some(now);
            account.sent_today
        })
    }
}
