use crate::errors::BrokerError;
use serde::{de::DeserializeOwned, Serialize};

/// Payload codec for a given message type.
///
/// A codec is carried by the descriptor that names the queue, so every
/// publish, subscribe and call site agrees on the wire format for that type.
pub trait Codec<T>: Send + Sync {
    fn content_type(&self) -> &'static str;
    fn encode(&self, value: &T) -> Result<Vec<u8>, BrokerError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, BrokerError>;
}

/// Default codec, `application/json` via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(value).map_err(|_| BrokerError::SerializationError)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, BrokerError> {
        serde_json::from_slice(bytes).map_err(|_| BrokerError::SerializationError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SomeEvent {
        id: u64,
        name: String,
    }

    #[test]
    fn should_roundtrip_json_payload() {
        let event = SomeEvent {
            id: 7,
            name: "created".to_owned(),
        };

        let bytes = JsonCodec.encode(&event).unwrap();
        let decoded: SomeEvent = JsonCodec.decode(&bytes).unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn should_fail_with_serialization_error_on_malformed_input() {
        let res: Result<SomeEvent, BrokerError> = JsonCodec.decode(b"not-json");

        assert_eq!(res, Err(BrokerError::SerializationError));
    }
}
