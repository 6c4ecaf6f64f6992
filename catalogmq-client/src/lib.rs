//! Producers and consumers moving typed entities through broker queues.
//!
//! A [`Producer`] serializes an entity with an injected [`Codec`] and publishes it on a queue,
//! opening and releasing a whole connection per send. A [`Consumer`] owns a poll loop on its own
//! tokio task, decodes every text message of the queue and hands the entity to a [`Processor`].
//!
//! The broker itself is behind the [`ConnectionProvider`] trait, so the same code runs on the
//! in-process [`MemoryBroker`] and, with the `amqp` feature, on an AMQP 0.9.1 server.
mod dev;
pub use dev::setup_logger;

#[cfg(feature = "amqp")]
mod amqp;
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnectionProvider;

mod broker;
pub use broker::{provider_from_config, Connection, ConnectionProvider, Publisher, Queue, Session, Subscription};

mod config;
pub use config::{BrokerConfig, ConsumerBehavior, QueueConfig};

mod consumer;
pub use consumer::{Consumer, ConsumerState, ManagedConsumer};

mod error;
pub use error::{ConnectionError, ResourceTeardownError, SendFailure};

mod memory;
pub use memory::{FailurePoint, MemoryBroker, MemoryConnector};

mod message;
pub use message::Message;

mod processor;
pub use processor::{processor_fn, FnProcessor, Processor};

mod producer;
pub use producer::Producer;

mod resources;

pub use catalogmq_codec::{Codec, JsonCodec, SerializationError};
