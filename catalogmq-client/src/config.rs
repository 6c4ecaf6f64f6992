use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

/// Where the broker is and how to log in.
#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl BrokerConfig {
    pub fn new(url: &str, username: &str, password: &str) -> Self {
        Self {
            url: url.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }
}

/// How long a consumer keeps its connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerBehavior {
    /// Keeps polling until it is stopped.
    #[default]
    Persistent,
    /// Polls once, processes at most one message and releases the connection.
    SingleRead,
}

/// Per queue settings of producers and consumers.
#[derive(Clone, Debug, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// The longest a single receive blocks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub behavior: ConsumerBehavior,
    /// Upper limit of one processing callback, 0 switches the limit off.
    #[serde(default = "default_process_timeout_ms")]
    pub process_timeout_ms: u64,
    /// Whether the owner should start the consumer again once it stopped.
    #[serde(default)]
    pub restart: bool,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_process_timeout_ms() -> u64 {
    30_000
}

impl QueueConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            poll_interval_ms: default_poll_interval_ms(),
            behavior: ConsumerBehavior::default(),
            process_timeout_ms: default_process_timeout_ms(),
            restart: false,
        }
    }

    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval_ms = value.as_millis() as u64;
        self
    }

    pub fn behavior(mut self, value: ConsumerBehavior) -> Self {
        self.behavior = value;
        self
    }

    pub fn process_timeout(mut self, value: Option<Duration>) -> Self {
        self.process_timeout_ms = value.map_or(0, |d| d.as_millis() as u64);
        self
    }

    pub fn restart(mut self, value: bool) -> Self {
        self.restart = value;
        self
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn process_timeout_duration(&self) -> Option<Duration> {
        match self.process_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
