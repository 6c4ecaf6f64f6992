//! The boundary towards the queue service.
//!
//! It follows the classic JMS shape: a connection opens sessions, a session resolves queues and
//! creates publishers and subscriptions on them. Every handle is closable and closing is always
//! explicit, the owner decides the order.
use crate::config::BrokerConfig;
use crate::error::ConnectionError;
use crate::memory::MemoryBroker;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Queue resolved by a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
}

/// Source of broker connections. Every call gives a brand new connection, there is no pooling.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError>;
}

#[async_trait]
pub trait Connection: Send {
    /// Starts the delivery of incoming messages. Consumers call it before opening sessions.
    async fn start(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn create_session(&mut self) -> Result<Box<dyn Session>, ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait Session: Send {
    async fn create_queue(&mut self, name: &str) -> Result<Queue, ConnectionError>;

    async fn create_publisher(&mut self, queue: &Queue) -> Result<Box<dyn Publisher>, ConnectionError>;

    async fn create_subscription(&mut self, queue: &Queue) -> Result<Box<dyn Subscription>, ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Sending side of a queue.
#[async_trait]
pub trait Publisher: Send {
    async fn send(&mut self, message: Message) -> Result<(), ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Receiving side of a queue.
#[async_trait]
pub trait Subscription: Send {
    /// Waits at most `timeout` for the next message. `Ok(None)` means nothing arrived in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Choose the provider by the scheme of the broker url.
///
/// `memory://` starts an in-process [`MemoryBroker`] and logs in with the configured user,
/// `amqp://` and `amqps://` need the `amqp`
/// feature.
pub fn provider_from_config(config: &BrokerConfig) -> Result<Arc<dyn ConnectionProvider>, ConnectionError> {
    let url = url::Url::parse(&config.url).map_err(|e| ConnectionError::InvalidUrl {
        url: config.url.clone(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "memory" => Ok(Arc::new(MemoryBroker::start().connector(&config.username, &config.password))),
        #[cfg(feature = "amqp")]
        "amqp" | "amqps" => Ok(Arc::new(crate::amqp::AmqpConnectionProvider::new(config)?)),
        scheme => Err(ConnectionError::InvalidUrl {
            url: config.url.clone(),
            reason: format!("unsupported scheme {scheme:?}"),
        }),
    }
}
