//! Wire envelope shared by the discovery and data channels.
//!
//! Every UDP datagram and every TCP connection carries exactly one
//! envelope: a type tag plus the serialized payload bytes. Receivers
//! dispatch on the tag and only then decode the payload, so unknown
//! message kinds can be dropped without understanding them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Failed to encode {tag} payload: {source}")]
    Encode {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Failed to decode {tag} payload: {source}")]
    Payload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The one wire shape both channels speak.
///
/// Wire format: `{"type":"shout","payload":[123,34,...]}`
///
/// The `payload` field is a `Vec<u8>` that serializes as a JSON number
/// array, so the envelope itself never needs to understand the message it
/// carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub tag: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    /// Wrap a typed message under its tag.
    pub fn pack<T: Serialize>(tag: &str, message: &T) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_vec(message).map_err(|source| EnvelopeError::Encode {
            tag: tag.to_string(),
            source,
        })?;
        Ok(Self::new(tag, payload))
    }

    /// Decode the payload as `T`. Callers pick `T` by matching on the tag
    /// first.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_slice(&self.payload).map_err(|source| EnvelopeError::Payload {
            tag: self.tag.clone(),
            source,
        })
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Envelope serialization should not fail")
    }

    /// Try to parse an envelope from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(data).map_err(EnvelopeError::Decode)
    }
}
