use crate::broker::ConnectionProvider;
use crate::error::SendFailure;
use crate::message::Message;
use crate::resources::Handles;
use catalogmq_codec::Codec;
use log::{debug, error, info};
use std::sync::Arc;

/// Publishes entities of type `E` to one queue.
///
/// Every [`Producer::send`] opens its own connection and closes it before returning, so a
/// producer can be shared by any number of concurrent callers.
pub struct Producer<E> {
    provider: Arc<dyn ConnectionProvider>,
    codec: Arc<dyn Codec<E>>,
    queue_name: String,
}

impl<E> Producer<E> {
    pub fn new(provider: Arc<dyn ConnectionProvider>, codec: Arc<dyn Codec<E>>, queue_name: &str) -> Self {
        Self {
            provider,
            codec,
            queue_name: queue_name.to_owned(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Serialize `entity` and hand it over to the broker.
    ///
    /// The publisher, the session and the connection are closed in this order whatever the
    /// outcome is. Nothing is retried.
    pub async fn send(&self, entity: &E) -> Result<(), SendFailure> {
        let mut handles = Handles::default();

        let result = self.publish(&mut handles, entity).await;

        handles.release().await;

        match &result {
            Ok(()) => info!("Sent message to queue {}", self.queue_name),
            Err(e) => error!("Error sending message to queue {}: {}", self.queue_name, e),
        }

        result
    }

    async fn publish(&self, handles: &mut Handles, entity: &E) -> Result<(), SendFailure> {
        let connection = handles.connection.insert(self.provider.connect().await?);
        let session = handles.session.insert(connection.create_session().await?);
        let queue = session.create_queue(&self.queue_name).await?;
        let publisher = handles.publisher.insert(session.create_publisher(&queue).await?);

        let text = self.codec.encode(entity)?;

        debug!("Message to queue {}: {}", self.queue_name, text);

        publisher.send(Message::Text(text)).await?;

        Ok(())
    }
}
