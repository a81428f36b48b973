//! Mail transport contracts.
//!
//! A [`TransportFactory`] opens a [`MailTransport`] for one sending account;
//! the engine sends a single message through it and disconnects. Real SMTP or
//! HTTP-API transports live outside this crate; [`LogTransport`] is the
//! development stand-in that only logs what it would have sent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use drip_core::DripResult;

use crate::account::{ProviderKind, SendingAccount};

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> DripResult<()>;

    async fn disconnect(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, account: &SendingAccount) -> DripResult<Box<dyn MailTransport>>;
}

/// Transport that records sends in the log instead of delivering them.
pub struct LogTransport {
    account_id: String,
    from_email: String,
    provider: ProviderKind,
    sent: Arc<AtomicU64>,
}

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, to: &str, subject: &str, html: &str) -> DripResult<()> {
        debug!(
            account_id = %self.account_id,
            provider = ?self.provider,
            from = %self.from_email,
            to = %to,
            subject = %subject,
            html_bytes = html.len(),
            "Email dispatched (log transport)"
        );
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[derive(Default)]
pub struct LogTransportFactory {
    sent: Arc<AtomicU64>,
}

impl LogTransportFactory {
    pub fn new() -> Self {
        info!("Log transport initialized, emails will not leave this process");
        Self::default()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransportFactory for LogTransportFactory {
    async fn connect(&self, account: &SendingAccount) -> DripResult<Box<dyn MailTransport>> {
        Ok(Box::new(LogTransport {
            account_id: account.id.clone(),
            from_email: account.from_email.clone(),
            provider: account.provider,
            sent: self.sent.clone(),
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_transport_counts_sends() {
        let factory = LogTransportFactory::new();
        let account = SendingAccount::new("a", "a@example.com", ProviderKind::Mailgun);

        let transport = factory.connect(&account).await.unwrap();
        transport
            .send("ada@example.com", "Hello", "<p>Hi</p>")
            .await
            .unwrap();
        transport.disconnect().await;

        assert_eq!(factory.sent_count(), 1);
    }
}
