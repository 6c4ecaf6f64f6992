use crate::{Codec, SerializationError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON codec for any serde compatible entity.
///
/// Field strictness is the entity's business: entities which must not lose data on decode
/// should be declared with `#[serde(deny_unknown_fields)]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec {
    pretty: bool,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec which produces indented, human readable output.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl<E> Codec<E> for JsonCodec
where
    E: Serialize + DeserializeOwned,
{
    fn encode(&self, entity: &E) -> Result<String, SerializationError> {
        let text = if self.pretty {
            serde_json::to_string_pretty(entity)
        } else {
            serde_json::to_string(entity)
        };

        text.map_err(SerializationError::Encode)
    }

    fn decode(&self, text: &str) -> Result<E, SerializationError> {
        serde_json::from_str(text).map_err(SerializationError::Decode)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
