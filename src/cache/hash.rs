//! Content hashing.
//!
//! Versions are xxHash64 (seed 0) over a canonical JSON text, rendered as 16
//! lowercase hex digits. The canonical text sorts object keys and has no
//! insignificant whitespace, so field order and source format (JSON, YAML,
//! base64 JSON) do not affect the version.

use super::decode::DecoderRegistry;
use crate::api::{ResourceEntry, ResourceSource, SerializationFormat};
use serde::Serialize;
use serde_json::Value;
use std::hash::Hasher;
use std::sync::OnceLock;
use twox_hash::XxHash64;

/// Hash raw bytes into a version string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    format!("{:016x}", hasher.finish())
}

/// Canonical JSON text of a value.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hash any serializable value through its canonical JSON form.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let canonical = match serde_json::to_value(value) {
        Ok(v) => canonical_json(&v),
        // Non-string map keys; fall back to the derived serialization.
        Err(_) => serde_json::to_string(value).unwrap_or_default(),
    };
    hash_bytes(canonical.as_bytes())
}

fn default_decoders() -> &'static DecoderRegistry {
    static DECODERS: OnceLock<DecoderRegistry> = OnceLock::new();
    DECODERS.get_or_init(DecoderRegistry::default)
}

/// Version of an ordered resource list, using the built-in decoders.
pub fn resources_hash(entries: &[ResourceEntry], format: SerializationFormat) -> String {
    resources_hash_with(default_decoders(), entries, format)
}

/// Version of an ordered resource list.
///
/// Raw values are decoded first so only their logical content counts. A
/// value that does not decode is hashed as its raw text; the decode error
/// surfaces when the revision is built.
pub fn resources_hash_with(
    decoders: &DecoderRegistry,
    entries: &[ResourceEntry],
    format: SerializationFormat,
) -> String {
    let canonical: Vec<Value> = entries
        .iter()
        .map(|entry| {
            let body = match &entry.source {
                ResourceSource::Value(raw) => {
                    let value = decoders
                        .decode(format, raw)
                        .unwrap_or_else(|_| Value::String(raw.clone()));
                    serde_json::json!({ "value": value })
                }
                generator => serde_json::to_value(generator).unwrap_or(Value::Null),
            };
            serde_json::json!({ "type": entry.resource_type.as_str(), "source": body })
        })
        .collect();
    hash_bytes(canonical_json(&Value::Array(canonical)).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Blueprint, ResourceType};

    #[test]
    fn canonical_form_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"d":[1,2],"c":null}}"#).unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
    }

    #[test]
    fn version_shape() {
        let v = hash_bytes(b"x");
        assert_eq!(v.len(), 16);
        assert!(v.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn order_and_format_insensitive() {
        let json = vec![ResourceEntry::value(
            ResourceType::Cluster,
            r#"{"name":"c","connect_timeout":"1s"}"#,
        )];
        let reordered = vec![ResourceEntry::value(
            ResourceType::Cluster,
            r#"{ "connect_timeout": "1s", "name": "c" }"#,
        )];
        let yaml = vec![ResourceEntry::value(
            ResourceType::Cluster,
            "connect_timeout: 1s\nname: c\n",
        )];

        let expected = resources_hash(&json, SerializationFormat::Json);
        assert_eq!(resources_hash(&reordered, SerializationFormat::Json), expected);
        assert_eq!(resources_hash(&yaml, SerializationFormat::Yaml), expected);
    }

    #[test]
    fn list_order_and_type_matter() {
        let a = ResourceEntry::value(ResourceType::Cluster, r#"{"name":"a"}"#);
        let b = ResourceEntry::value(ResourceType::Cluster, r#"{"name":"b"}"#);
        let ab = resources_hash(&[a.clone(), b.clone()], SerializationFormat::Json);
        let ba = resources_hash(&[b, a.clone()], SerializationFormat::Json);
        assert_ne!(ab, ba);

        let listener = ResourceEntry::value(ResourceType::Listener, r#"{"name":"a"}"#);
        assert_ne!(
            resources_hash(&[a], SerializationFormat::Json),
            resources_hash(&[listener], SerializationFormat::Json)
        );
    }

    #[test]
    fn undecodable_values_still_hash() {
        let broken = vec![ResourceEntry::value(ResourceType::Cluster, "{")];
        let other = vec![ResourceEntry::value(ResourceType::Cluster, "{{")];
        assert_ne!(
            resources_hash(&broken, SerializationFormat::Json),
            resources_hash(&other, SerializationFormat::Json)
        );
    }

    #[test]
    fn generators_hash_by_reference() {
        let tls = vec![ResourceEntry::tls_secret("cert", Blueprint::TlsCertificate)];
        let ca = vec![ResourceEntry::tls_secret("cert", Blueprint::ValidationContext)];
        assert_ne!(
            resources_hash(&tls, SerializationFormat::Json),
            resources_hash(&ca, SerializationFormat::Json)
        );
    }
}
