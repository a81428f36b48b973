#![warn(clippy::unwrap_used)]

//! Outbound delivery: sending accounts, per-account circuit breaking,
//! healthy-account selection, and the mail transport contracts.

pub mod account;
pub mod circuit_breaker;
pub mod selector;
pub mod transport;

pub use account::{AccountStore, CircuitState, InMemoryAccountStore, ProviderKind, SendingAccount};
pub use circuit_breaker::{CircuitBreaker, CircuitCache};
pub use selector::AccountSelector;
pub use transport::{LogTransport, LogTransportFactory, MailTransport, TransportFactory};
