//! AMQP 0.9.1 provider built on `lapin`.
//!
//! A session is an AMQP channel. Messages are published on the default exchange with the queue
//! name as routing key, queues are declared durable. Subscriptions use a prefetch of one. A
//! delivery is acknowledged only when the consumer comes back for the next one or closes the
//! subscription, so a delivery dropped on the way is redelivered once the channel closes.
use crate::broker::{Connection, ConnectionProvider, Publisher, Queue, Session, Subscription};
use crate::config::BrokerConfig;
use crate::error::ConnectionError;
use crate::message::Message;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ConnectionProperties};
use log::{debug, trace};
use std::time::Duration;

const TEXT: &str = "text/plain";
const BINARY: &str = "application/octet-stream";

/// Opens a new AMQP connection on every `connect()`.
pub struct AmqpConnectionProvider {
    /// Url with the credentials filled in.
    url: String,
    /// Url as configured, this one goes into errors and logs.
    display_url: String,
    username: String,
}

impl AmqpConnectionProvider {
    /// The username and password of the config take precedence over the ones in the url.
    pub fn new(config: &BrokerConfig) -> Result<Self, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidUrl {
            url: config.url.clone(),
            reason,
        };

        let mut url = url::Url::parse(&config.url).map_err(|e| invalid(e.to_string()))?;

        if !config.username.is_empty() {
            url.set_username(&config.username)
                .map_err(|_| invalid("url cannot have credentials".to_owned()))?;
            url.set_password(Some(&config.password))
                .map_err(|_| invalid("url cannot have credentials".to_owned()))?;
        }

        let username = url.username().to_owned();

        Ok(Self {
            url: url.into(),
            display_url: config.url.clone(),
            username,
        })
    }

    fn connect_error(&self, err: lapin::Error) -> ConnectionError {
        let reason = err.to_string();

        if reason.contains("ACCESS_REFUSED") || reason.contains("ACCESS-REFUSED") {
            return ConnectionError::AccessRefused {
                username: self.username.clone(),
            };
        }

        ConnectionError::Unreachable {
            url: self.display_url.clone(),
            reason,
        }
    }
}

#[async_trait]
impl ConnectionProvider for AmqpConnectionProvider {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        let properties = ConnectionProperties::default().with_connection_name("catalogmq".into());

        let connection = lapin::Connection::connect(&self.url, properties)
            .await
            .map_err(|e| self.connect_error(e))?;

        debug!("Connected to {} as {:?}", self.display_url, self.username);

        Ok(Box::new(AmqpConnection {
            connection: Some(connection),
        }))
    }
}

struct AmqpConnection {
    connection: Option<lapin::Connection>,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_session(&mut self) -> Result<Box<dyn Session>, ConnectionError> {
        let connection = self.connection.as_ref().ok_or(ConnectionError::Closed("connection"))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConnectionError::broker("create session", e))?;

        Ok(Box::new(AmqpSession { channel: Some(channel) }))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let connection = self.connection.take().ok_or(ConnectionError::Closed("connection"))?;

        connection
            .close(200, "Normal close")
            .await
            .map_err(|e| ConnectionError::broker("close connection", e))
    }
}

struct AmqpSession {
    channel: Option<Channel>,
}

impl AmqpSession {
    fn channel(&self) -> Result<&Channel, ConnectionError> {
        self.channel.as_ref().ok_or(ConnectionError::Closed("session"))
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn create_queue(&mut self, name: &str) -> Result<Queue, ConnectionError> {
        let options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel()?
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| ConnectionError::broker("create queue", e))?;

        Ok(Queue { name: name.to_owned() })
    }

    async fn create_publisher(&mut self, queue: &Queue) -> Result<Box<dyn Publisher>, ConnectionError> {
        Ok(Box::new(AmqpPublisher {
            channel: Some(self.channel()?.clone()),
            queue: queue.name.clone(),
        }))
    }

    async fn create_subscription(&mut self, queue: &Queue) -> Result<Box<dyn Subscription>, ConnectionError> {
        let channel = self.channel()?.clone();

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| ConnectionError::broker("create subscription", e))?;

        let tag = format!("catalogmq-{}", uuid::Uuid::new_v4());

        let consumer = channel
            .basic_consume(&queue.name, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| ConnectionError::broker("create subscription", e))?;

        trace!("Consuming queue {} with tag {}", queue.name, tag);

        Ok(Box::new(AmqpSubscription {
            channel: Some(channel),
            consumer,
            tag,
            handed_out: None,
        }))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let channel = self.channel.take().ok_or(ConnectionError::Closed("session"))?;

        channel
            .close(200, "Normal close")
            .await
            .map_err(|e| ConnectionError::broker("close session", e))
    }
}

struct AmqpPublisher {
    channel: Option<Channel>,
    queue: String,
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn send(&mut self, message: Message) -> Result<(), ConnectionError> {
        let channel = self.channel.as_ref().ok_or(ConnectionError::Closed("publisher"))?;

        let (payload, content_type) = match message {
            Message::Text(text) => (text.into_bytes(), TEXT),
            Message::Bytes(bytes) => (bytes, BINARY),
        };

        let confirm = channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type(content_type.into()),
            )
            .await
            .map_err(|e| ConnectionError::broker("publish", e))?;

        confirm.await.map_err(|e| ConnectionError::broker("publish", e))?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        // The channel belongs to the session, the publisher only lets it go.
        self.channel
            .take()
            .map(drop)
            .ok_or(ConnectionError::Closed("publisher"))
    }
}

struct AmqpSubscription {
    channel: Option<Channel>,
    consumer: lapin::Consumer,
    tag: String,
    /// Acker of the delivery returned by the last `receive`, not acknowledged yet.
    handed_out: Option<Acker>,
}

impl AmqpSubscription {
    async fn settle(&mut self) -> Result<(), ConnectionError> {
        if let Some(acker) = &self.handed_out {
            acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| ConnectionError::broker("ack", e))?;

            self.handed_out = None;
        }

        Ok(())
    }
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, ConnectionError> {
        if self.channel.is_none() {
            return Err(ConnectionError::Closed("subscription"));
        }

        // The broker holds back the next delivery until the previous one is acknowledged.
        self.settle().await?;

        let delivery = match tokio::time::timeout(timeout, self.consumer.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(ConnectionError::Closed("subscription")),
            Ok(Some(delivery)) => delivery.map_err(|e| ConnectionError::broker("receive", e))?,
        };

        let binary = delivery
            .properties
            .content_type()
            .as_ref()
            .is_some_and(|ct| ct.as_str() == BINARY);

        let message = if binary {
            Message::Bytes(delivery.data)
        } else {
            match String::from_utf8(delivery.data) {
                Ok(text) => Message::Text(text),
                Err(e) => Message::Bytes(e.into_bytes()),
            }
        };

        self.handed_out = Some(delivery.acker);

        Ok(Some(message))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.channel.is_none() {
            return Err(ConnectionError::Closed("subscription"));
        }

        let settled = self.settle().await;
        let channel = self.channel.take().ok_or(ConnectionError::Closed("subscription"))?;

        settled?;

        channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|e| ConnectionError::broker("close subscription", e))
    }
}
