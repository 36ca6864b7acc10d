use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::storage::indexes::IndexPollPolicy;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    /// Wall-clock period between scheduler ticks.
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    /// Treat `failed` sources as due once their interval has elapsed again.
    #[serde(default)]
    pub retry_failed: bool,
    /// How long a `running` source may go without a heartbeat before it is reclaimed.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_index_poll_initial_ms")]
    pub index_poll_initial_ms: u64,
    #[serde(default = "default_index_poll_max_ms")]
    pub index_poll_max_ms: u64,
    #[serde(default = "default_index_timeout_secs")]
    pub index_timeout_secs: u64,
}

fn default_scheduler_tick_secs() -> u64 {
    60
}

fn default_lease_secs() -> u64 {
    3600
}

fn default_index_poll_initial_ms() -> u64 {
    500
}

fn default_index_poll_max_ms() -> u64 {
    5_000
}

fn default_index_timeout_secs() -> u64 {
    600
}

impl AppConfig {
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs.max(1))
    }

    pub fn index_poll_policy(&self) -> IndexPollPolicy {
        IndexPollPolicy {
            initial_interval: Duration::from_millis(self.index_poll_initial_ms.max(1)),
            max_interval: Duration::from_millis(self.index_poll_max_ms.max(1)),
            timeout: Duration::from_secs(self.index_timeout_secs.max(1)),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "ingest".to_string(),
            surrealdb_database: "sources".to_string(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            retry_failed: false,
            lease_secs: default_lease_secs(),
            index_poll_initial_ms: default_index_poll_initial_ms(),
            index_poll_max_ms: default_index_poll_max_ms(),
            index_timeout_secs: default_index_timeout_secs(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
