use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub business_rules: BusinessRules,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    #[serde(default = "default_fee_fraction")]
    pub platform_fee_fraction: f64,
    /// Maximum pickup-to-dropoff distance for a match
    #[serde(default = "default_radius_km")]
    pub match_radius_km: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_fee_fraction() -> f64 { 0.05 }
fn default_radius_km() -> f64 { 15.0 }
fn default_currency() -> String { "INR".to_string() }

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            platform_fee_fraction: default_fee_fraction(),
            match_radius_km: default_radius_km(),
            currency: default_currency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 { 5 }
fn default_acquire_timeout() -> u64 { 3 }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_message_timeout")]
    pub message_timeout_ms: u64,
}

fn default_message_timeout() -> u64 { 5000 }

#[derive(Debug, Deserialize, Clone)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Attempts per donation when a sweep races another transition
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 200,
            max_attempts: 3,
            base_delay_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
    pub broadcast_capacity: usize,
    /// Hold events in the outbox while the in-process sink has no listener
    #[serde(default)]
    pub require_subscribers: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            batch_size: 100,
            broadcast_capacity: 1024,
            require_subscribers: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `FOODLINK__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("FOODLINK").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
