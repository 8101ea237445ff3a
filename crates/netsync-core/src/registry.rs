//! Static registry of replicated value types.
//!
//! Every participating process registers the same set of value types at
//! startup under stable string tags (closed world). Outgoing mutations
//! look up the tag for a Rust type; incoming mutations resolve the
//! carried tag and verify the payload decodes before it is stored.
//! Dispatch is a table lookup, never runtime reflection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("No value type registered under tag {0:?}")]
    UnknownTag(String),
    #[error("Type {0} is not registered")]
    UnregisteredType(&'static str),
    #[error("Failed to encode value for tag {tag:?}: {source}")]
    Encode {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Payload does not decode as tag {tag:?}: {source}")]
    Decode {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

type DecodeCheck = Box<dyn Fn(&[u8]) -> Result<(), serde_json::Error> + Send + Sync>;

/// Tag→codec table populated once at startup, then shared read-only
/// (`Arc<TypeRegistry>`).
pub struct TypeRegistry {
    checks: HashMap<String, DecodeCheck>,
    tags: HashMap<TypeId, String>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self {
            checks: HashMap::new(),
            tags: HashMap::new(),
        }
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `tag`. Registering the same tag again replaces
    /// the earlier entry.
    pub fn register<T>(&mut self, tag: &str)
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.checks.insert(
            tag.to_string(),
            Box::new(|bytes| serde_json::from_slice::<T>(bytes).map(|_| ())),
        );
        self.tags.insert(TypeId::of::<T>(), tag.to_string());
    }

    /// The tag `T` was registered under, if any.
    pub fn tag_of<T: 'static>(&self) -> Option<&str> {
        self.tags.get(&TypeId::of::<T>()).map(|s| s.as_str())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.checks.contains_key(tag)
    }

    /// Serialize a value together with its registered tag.
    pub fn encode<T>(&self, value: &T) -> Result<(String, Vec<u8>), CodecError>
    where
        T: Serialize + 'static,
    {
        let tag = self
            .tag_of::<T>()
            .ok_or(CodecError::UnregisteredType(std::any::type_name::<T>()))?
            .to_string();
        let bytes = serde_json::to_vec(value).map_err(|source| CodecError::Encode {
            tag: tag.clone(),
            source,
        })?;
        Ok((tag, bytes))
    }

    /// Verify `bytes` decode as the type registered under `tag`.
    ///
    /// This is the gate incoming mutations pass before they are stored:
    /// an unknown tag or an undecodable payload rejects the message.
    pub fn check(&self, tag: &str, bytes: &[u8]) -> Result<(), CodecError> {
        let check = self
            .checks
            .get(tag)
            .ok_or_else(|| CodecError::UnknownTag(tag.to_string()))?;
        check(bytes).map_err(|source| CodecError::Decode {
            tag: tag.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register::<Note>("note");
        registry.register::<Counter>("counter");
        registry
    }

    #[test]
    fn test_tag_lookup_by_type() {
        let registry = registry();
        assert_eq!(registry.tag_of::<Note>(), Some("note"));
        assert_eq!(registry.tag_of::<Counter>(), Some("counter"));
        assert_eq!(registry.tag_of::<String>(), None);
    }

    #[test]
    fn test_contains() {
        let registry = registry();
        assert!(registry.contains("note"));
        assert!(!registry.contains("unknown"));
    }

    #[test]
    fn test_encode_carries_tag() {
        let registry = registry();
        let (tag, bytes) = registry
            .encode(&Note {
                text: "hello".into(),
            })
            .unwrap();
        assert_eq!(tag, "note");
        assert_eq!(bytes, br#"{"text":"hello"}"#);
    }

    #[test]
    fn test_encode_unregistered_type_fails() {
        let registry = registry();
        let err = registry.encode(&"plain string".to_string()).unwrap_err();
        assert!(matches!(err, CodecError::UnregisteredType(_)));
    }

    #[test]
    fn test_check_accepts_matching_payload() {
        let registry = registry();
        assert!(registry.check("note", br#"{"text":"hi"}"#).is_ok());
    }

    #[test]
    fn test_check_rejects_unknown_tag() {
        let registry = registry();
        let err = registry.check("mystery", b"{}").unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(_)));
    }

    #[test]
    fn test_check_rejects_wrong_shape() {
        let registry = registry();
        let err = registry.check("counter", br#"{"text":"hi"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn test_reregistering_tag_replaces_entry() {
        let mut registry = registry();
        registry.register::<Counter>("note");
        // "note" now validates as Counter
        assert!(registry.check("note", br#"{"value":1}"#).is_ok());
        assert!(registry.check("note", br#"{"text":"hi"}"#).is_err());
    }
}
