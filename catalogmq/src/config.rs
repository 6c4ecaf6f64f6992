use anyhow::{Context, Result};
use catalogmq_client::{BrokerConfig, QueueConfig};
use clap::Parser;
use serde_derive::Deserialize;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "catalogmq", version, about = "Product catalog ingestion service")]
pub(crate) struct Cli {
    /// Path to the config file
    #[arg(short, long = "config", value_name = "FILE", default_value = "catalogmq.toml")]
    pub(crate) config_file_path: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) network: Network,
    pub(crate) broker: BrokerConfig,
    #[serde(default)]
    pub(crate) supervisor: Supervisor,
    pub(crate) queues: Queues,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Network {
    pub(crate) http_listen: String,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            http_listen: "127.0.0.1:8080".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Supervisor {
    /// How often stopped consumers are looked for.
    pub(crate) interval_ms: u64,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self { interval_ms: 5000 }
    }
}

impl Supervisor {
    pub(crate) fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Queues {
    pub(crate) product: QueueConfig,
    pub(crate) category: QueueConfig,
}

pub(crate) fn parse_config(path: &str) -> Result<Config> {
    let cfg = std::fs::read_to_string(path).with_context(|| format!("cannot read config file {path}"))?;

    from_toml(&cfg).with_context(|| format!("invalid config file {path}"))
}

fn from_toml(text: &str) -> Result<Config> {
    Ok(toml::from_str(text)?)
}
