//! Converting entities to and from the textual payload of queue messages.
//!
//! A [`Codec`] is injected into producers and consumers, so the messaging code never knows the
//! concrete serialization format. [`JsonCodec`] is the one shipped here.
mod json;
pub use json::JsonCodec;


/// Error of converting an entity to or from text.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("cannot encode entity: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("cannot decode entity: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Converts values of `E` into text and back.
///
/// Implementations must be lossless: `decode(encode(e)) == e` for every valid entity, and
/// `decode` must reject text which doesn't match the schema of `E` instead of coercing it.
pub trait Codec<E>: Send + Sync {
    fn encode(&self, entity: &E) -> Result<String, SerializationError>;

    fn decode(&self, text: &str) -> Result<E, SerializationError>;

    /// MIME type of the produced text.
    fn content_type(&self) -> &'static str;
}
