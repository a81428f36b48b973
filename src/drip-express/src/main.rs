//! Drip Express: email drip sequence worker.
//!
//! Wires the in-memory stores, circuit breaker, account selector and engine
//! together and processes due enrollments on a fixed interval.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use drip_core::config::AppConfig;
use drip_core::event_bus::log_sink;
use drip_delivery::{
    AccountSelector, CircuitBreaker, CircuitCache, InMemoryAccountStore, LogTransportFactory,
    ProviderKind, SendingAccount,
};
use drip_sequences::content::BlockCompiler;
use drip_sequences::demo::seed_welcome_series;
use drip_sequences::tracking::InMemoryTracking;
use drip_sequences::types::RecipientData;
use drip_sequences::{EngineSettings, InMemorySequenceStore, SequenceEngine};

#[derive(Parser, Debug)]
#[command(name = "drip-express")]
#[command(about = "Email drip sequence automation worker")]
#[command(version)]
struct Cli {
    /// Optional configuration file (TOML, YAML or JSON)
    #[arg(long, env = "DRIP_EXPRESS_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "DRIP_EXPRESS__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between due-work ticks (overrides config)
    #[arg(long, env = "DRIP_EXPRESS__SCHEDULER__TICK_INTERVAL_SECS")]
    tick_interval: Option<u64>,

    /// Seed the demo welcome series and sending accounts
    #[arg(long, default_value_t = false)]
    seed_demo: bool,

    /// Recipient to enroll in the demo sequence
    #[arg(long, requires = "seed_demo")]
    demo_recipient: Option<String>,

    /// Run a single tick and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

fn demo_accounts(store: &InMemoryAccountStore) {
    let mut primary = SendingAccount::new("smtp-primary", "hello@example.com", ProviderKind::Smtp);
    primary.name = "Primary SMTP".to_string();
    primary.priority = 10;
    store.upsert_account(primary);

    let mut backup =
        SendingAccount::new("sendgrid-backup", "hello@example.com", ProviderKind::SendGrid);
    backup.name = "SendGrid backup".to_string();
    backup.priority = 20;
    store.upsert_account(backup);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "drip_express=info,drip_sequences=info,drip_delivery=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Drip Express starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.tick_interval {
        config.scheduler.tick_interval_secs = secs;
    }

    info!(
        node_id = %config.node_id,
        tick_interval_secs = config.scheduler.tick_interval_secs,
        failure_threshold = config.circuit_breaker.failure_threshold,
        cooldown_secs = config.circuit_breaker.cooldown_secs,
        "Configuration loaded"
    );

    // Delivery: accounts, breaker, selector
    let accounts = Arc::new(InMemoryAccountStore::new());
    let mut breaker = CircuitBreaker::new(accounts.clone(), config.circuit_breaker.clone());
    if config.circuit_breaker.cache_ttl_secs > 0 {
        breaker = breaker.with_cache(Arc::new(CircuitCache::new(
            config.circuit_breaker.cache_ttl_secs,
        )));
    }
    let selector = Arc::new(AccountSelector::new(accounts.clone(), Arc::new(breaker)));
    let transports = Arc::new(LogTransportFactory::new());

    let store = Arc::new(InMemorySequenceStore::new());
    let engine = SequenceEngine::new(
        store.clone(),
        selector,
        transports.clone(),
        Arc::new(BlockCompiler::new()),
        Arc::new(InMemoryTracking::new()),
        EngineSettings::from_config(&config),
    )
    .with_event_sink(log_sink());

    if cli.seed_demo {
        demo_accounts(&accounts);
        let sequence = seed_welcome_series(store.as_ref()).context("seeding demo sequence")?;
        if let Some(email) = cli.demo_recipient.as_deref() {
            let mut data = RecipientData::new();
            data.insert("first_name".to_string(), serde_json::json!("there"));
            let enrollment_id = engine
                .enroll(sequence.id, email, data)
                .context("enrolling demo recipient")?;
            info!(enrollment_id = %enrollment_id, recipient = %email, "Demo recipient enrolled");
        }
    }

    if cli.once {
        let processed = engine.process_due(Utc::now()).await?;
        info!(processed, sent = transports.sent_count(), "Single tick complete");
        return Ok(());
    }

    if !config.scheduler.enabled {
        info!("Scheduler disabled, nothing to do");
        return Ok(());
    }

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        config.scheduler.tick_interval_secs.max(1),
    ));
    info!("Drip Express is processing due enrollments");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = engine.process_due(Utc::now()).await {
                    error!(error = %e, "Due-work tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(sent = transports.sent_count(), "Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
