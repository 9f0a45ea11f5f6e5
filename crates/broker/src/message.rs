use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;
use watchrabbit_core::Event;

use crate::error::BrokerError;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Wire-format envelope for one published event.
///
/// The payload is the JSON body. `kind` carries the schema name
/// (e.g. `analysis.requested`) and ends up in the AMQP `type` property.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    pub message_id: Uuid,
    /// Delivery mode 2 when set.
    pub persistent: bool,
}

impl Envelope {
    /// Serialize an event into a persistent JSON envelope.
    pub fn encode<E: Event>(event: &E) -> Result<Self, BrokerError> {
        Ok(Self {
            kind: E::KIND.as_str().to_string(),
            payload: serde_json::to_vec(event).map_err(BrokerError::Serialization)?,
            content_type: CONTENT_TYPE_JSON.to_string(),
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
            persistent: true,
        })
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        decode_body(&self.payload)
    }
}

/// Deserialize a raw delivery body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, BrokerError> {
    serde_json::from_slice(body).map_err(BrokerError::Deserialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchrabbit_core::{AnalysisRequested, FileDetected};

    #[test]
    fn encode_sets_kind_and_properties() {
        let event = FileDetected::new("/data/a.csv", ".csv", 120);
        let env = Envelope::encode(&event).unwrap();

        assert_eq!(env.kind, "file.detected");
        assert_eq!(env.content_type, "application/json");
        assert!(env.persistent);
        assert_eq!(env.decode::<FileDetected>().unwrap(), event);
    }

    #[test]
    fn decoding_wrong_shape_is_deserialization_error() {
        let err = decode_body::<AnalysisRequested>(b"{\"filePath\": 3}").unwrap_err();
        assert!(matches!(err, BrokerError::Deserialization(_)));
        assert!(!err.is_connection_fault());
    }

    #[test]
    fn every_envelope_gets_a_fresh_id() {
        let event = FileDetected::new("/data/a.csv", ".csv", 1);
        let a = Envelope::encode(&event).unwrap();
        let b = Envelope::encode(&event).unwrap();
        assert_ne!(a.message_id, b.message_id);
    }
}
