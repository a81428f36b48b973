use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRIP_EXPRESS__` (nested keys separated by `__`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Due-work polling.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// How long a claimed enrollment stays owned by the worker that claimed it.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
    /// TTL of the per-worker circuit cache; 0 disables caching.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_scheduler_enabled() -> bool {
    true
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_claim_lease_secs() -> i64 {
    300
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> i64 {
    300
}
fn default_cache_ttl_secs() -> u64 {
    5
}
fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional TOML file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("DRIP_EXPRESS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_breaker_contract() {
        let config = AppConfig::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cooldown_secs, 300);
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"scheduler": {"tick_interval_secs": 5}}"#).unwrap();
        assert_eq!(config.scheduler.tick_interval_secs, 5);
        assert_eq!(config.scheduler.claim_lease_secs, 300);
        assert_eq!(config.node_id, "node-01");
    }
}
