//! Raw resource decoders.
//!
//! Every serialization format decodes raw text into a `serde_json::Value`,
//! which is the common form for typed decoding and hashing. Decoders are
//! looked up by format so a new format is one registration.

use crate::api::SerializationFormat;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;

/// Decodes raw resource text into a JSON value.
pub trait Decoder: Send + Sync {
    fn decode(&self, raw: &str) -> Result<serde_json::Value, String>;
}

/// `json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, raw: &str) -> Result<serde_json::Value, String> {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }
}

/// `b64json`: standard base64 around JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct B64JsonDecoder;

impl Decoder for B64JsonDecoder {
    fn decode(&self, raw: &str) -> Result<serde_json::Value, String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|e| format!("invalid base64: {}", e))?;
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
    }
}

/// `yaml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlDecoder;

impl Decoder for YamlDecoder {
    fn decode(&self, raw: &str) -> Result<serde_json::Value, String> {
        serde_yaml::from_str(raw).map_err(|e| e.to_string())
    }
}

/// Decoders keyed by serialization format.
#[derive(Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<SerializationFormat, Arc<dyn Decoder>>,
}

impl DecoderRegistry {
    /// Registry without any decoder.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register or replace the decoder for a format.
    pub fn register(&mut self, format: SerializationFormat, decoder: Arc<dyn Decoder>) {
        self.decoders.insert(format, decoder);
    }

    pub fn get(&self, format: SerializationFormat) -> Option<&Arc<dyn Decoder>> {
        self.decoders.get(&format)
    }

    /// Decode with the decoder registered for `format`.
    pub fn decode(&self, format: SerializationFormat, raw: &str) -> Result<serde_json::Value, String> {
        match self.get(format) {
            Some(decoder) => decoder.decode(raw),
            None => Err(format!("no decoder registered for {}", format)),
        }
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(SerializationFormat::Json, Arc::new(JsonDecoder));
        registry.register(SerializationFormat::B64Json, Arc::new(B64JsonDecoder));
        registry.register(SerializationFormat::Yaml, Arc::new(YamlDecoder));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_agree() {
        let registry = DecoderRegistry::default();
        let expected = json!({"name": "c", "port": 80});

        let from_json = registry
            .decode(SerializationFormat::Json, r#"{"port":80,"name":"c"}"#)
            .unwrap();
        let from_yaml = registry
            .decode(SerializationFormat::Yaml, "name: c\nport: 80\n")
            .unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(r#"{"name":"c","port":80}"#);
        let from_b64 = registry
            .decode(SerializationFormat::B64Json, &encoded)
            .unwrap();

        assert_eq!(from_json, expected);
        assert_eq!(from_yaml, expected);
        assert_eq!(from_b64, expected);
    }

    #[test]
    fn errors_are_reported() {
        let registry = DecoderRegistry::default();
        assert!(registry.decode(SerializationFormat::Json, "{").is_err());
        assert!(registry
            .decode(SerializationFormat::B64Json, "not base64!")
            .unwrap_err()
            .contains("base64"));
        assert!(DecoderRegistry::empty()
            .decode(SerializationFormat::Json, "{}")
            .is_err());
    }
}
