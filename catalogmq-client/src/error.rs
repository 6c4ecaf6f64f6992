use catalogmq_codec::SerializationError;

/// Failure of talking to the broker: it cannot be reached, it refused the credentials or one of
/// the operations on a connection, session or queue handle failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("broker {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("broker refused access of user {username:?}")]
    AccessRefused { username: String },
    #[error("invalid broker url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{operation} failed: {reason}")]
    Broker { operation: &'static str, reason: String },
    #[error("{0} is already closed")]
    Closed(&'static str),
}

impl ConnectionError {
    pub(crate) fn broker(operation: &'static str, reason: impl ToString) -> Self {
        ConnectionError::Broker {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Error of [`Producer::send`](crate::Producer::send), wrapping the cause.
#[derive(Debug, thiserror::Error)]
pub enum SendFailure {
    #[error("send failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("send failed: {0}")]
    Serialization(#[from] SerializationError),
}

/// A handle couldn't be closed. It is only ever logged, closing the other handles goes on.
#[derive(Debug, thiserror::Error)]
#[error("error closing {resource}: {cause}")]
pub struct ResourceTeardownError {
    pub resource: &'static str,
    #[source]
    pub cause: ConnectionError,
}
