//! Typed resources.
//!
//! The eight resource classes form a closed union. Each class has a typed
//! struct with its identifying field and a few well-known fields; anything
//! else is kept in an open map. Decoding runs the per-class field table
//! first so a failure names the offending field, then deserializes.

use crate::api::{Blueprint, ResourceType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::hash::canonical_json;

/// Decode failure of one resource value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub field: Option<String>,
    pub message: String,
}

impl DecodeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    String,
    Object,
    Array,
}

impl Kind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Kind::String => value.is_string(),
            Kind::Object => value.is_object(),
            Kind::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Kind::String => "a string",
            Kind::Object => "an object",
            Kind::Array => "an array",
        }
    }
}

/// One typed field: snake_case name, camelCase alias, JSON kind, required.
type Field = (&'static str, &'static str, Kind, bool);

const ENDPOINT_FIELDS: &[Field] = &[
    ("cluster_name", "clusterName", Kind::String, true),
    ("endpoints", "endpoints", Kind::Array, false),
];
const CLUSTER_FIELDS: &[Field] = &[
    ("name", "name", Kind::String, true),
    ("connect_timeout", "connectTimeout", Kind::String, false),
];
const ROUTE_FIELDS: &[Field] = &[
    ("name", "name", Kind::String, true),
    ("virtual_hosts", "virtualHosts", Kind::Array, false),
];
const SCOPED_ROUTE_FIELDS: &[Field] = &[
    ("name", "name", Kind::String, true),
    ("route_configuration_name", "routeConfigurationName", Kind::String, false),
];
const LISTENER_FIELDS: &[Field] = &[
    ("name", "name", Kind::String, true),
    ("address", "address", Kind::Object, false),
    ("filter_chains", "filterChains", Kind::Array, false),
];
const SECRET_FIELDS: &[Field] = &[
    ("name", "name", Kind::String, true),
    ("tls_certificate", "tlsCertificate", Kind::Object, false),
    ("validation_context", "validationContext", Kind::Object, false),
    ("generic_secret", "genericSecret", Kind::Object, false),
];
const RUNTIME_FIELDS: &[Field] = &[
    ("name", "name", Kind::String, true),
    ("layer", "layer", Kind::Object, false),
];
const EXTENSION_CONFIG_FIELDS: &[Field] = &[
    ("name", "name", Kind::String, true),
    ("typed_config", "typedConfig", Kind::Object, true),
];

const fn fields(resource_type: ResourceType) -> &'static [Field] {
    match resource_type {
        ResourceType::Endpoint => ENDPOINT_FIELDS,
        ResourceType::Cluster => CLUSTER_FIELDS,
        ResourceType::Route => ROUTE_FIELDS,
        ResourceType::ScopedRoute => SCOPED_ROUTE_FIELDS,
        ResourceType::Listener => LISTENER_FIELDS,
        ResourceType::Secret => SECRET_FIELDS,
        ResourceType::Runtime => RUNTIME_FIELDS,
        ResourceType::ExtensionConfig => EXTENSION_CONFIG_FIELDS,
    }
}

fn check_fields(resource_type: ResourceType, value: &Value) -> Result<(), DecodeError> {
    let Some(map) = value.as_object() else {
        return Err(DecodeError::new("resource value must be an object"));
    };
    for &(name, alias, kind, required) in fields(resource_type) {
        let snake = map.get(name);
        let camel = if alias != name { map.get(alias) } else { None };
        let found = match (snake, camel) {
            (Some(_), Some(_)) => {
                return Err(DecodeError::field(
                    name,
                    format!("both {} and {} are set", name, alias),
                ))
            }
            (Some(v), None) | (None, Some(v)) => Some(v),
            (None, None) => None,
        };
        match found {
            Some(v) if !kind.matches(v) => {
                return Err(DecodeError::field(name, format!("expected {}", kind.name())))
            }
            Some(Value::String(s)) if required && s.is_empty() => {
                return Err(DecodeError::field(name, "must not be empty"))
            }
            None if required => return Err(DecodeError::field(name, "is required")),
            _ => {}
        }
    }
    Ok(())
}

/// `endpoint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLoadAssignment {
    #[serde(alias = "clusterName")]
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `cluster`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default, alias = "connectTimeout", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `route`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfiguration {
    pub name: String,
    #[serde(default, alias = "virtualHosts", skip_serializing_if = "Vec::is_empty")]
    pub virtual_hosts: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `scopedRoute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedRouteConfiguration {
    pub name: String,
    #[serde(
        default,
        alias = "routeConfigurationName",
        skip_serializing_if = "Option::is_none"
    )]
    pub route_configuration_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `listener`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Value>,
    #[serde(default, alias = "filterChains", skip_serializing_if = "Vec::is_empty")]
    pub filter_chains: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `secret`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    #[serde(default, alias = "tlsCertificate", skip_serializing_if = "Option::is_none")]
    pub tls_certificate: Option<Value>,
    #[serde(default, alias = "validationContext", skip_serializing_if = "Option::is_none")]
    pub validation_context: Option<Value>,
    #[serde(default, alias = "genericSecret", skip_serializing_if = "Option::is_none")]
    pub generic_secret: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn inline_string(s: &str) -> Value {
    serde_json::json!({ "inline_string": s })
}

impl Secret {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tls_certificate: None,
            validation_context: None,
            generic_secret: None,
            extra: Map::new(),
        }
    }

    /// Secret generated from TLS material.
    ///
    /// A validation context trusts `ca` when present, else the certificate.
    pub fn from_tls(
        name: &str,
        blueprint: Blueprint,
        certificate: &str,
        private_key: &str,
        ca: Option<&str>,
    ) -> Self {
        let mut secret = Self::named(name);
        match blueprint {
            Blueprint::TlsCertificate => {
                secret.tls_certificate = Some(serde_json::json!({
                    "certificate_chain": inline_string(certificate),
                    "private_key": inline_string(private_key),
                }));
            }
            Blueprint::ValidationContext => {
                secret.validation_context = Some(serde_json::json!({
                    "trusted_ca": inline_string(ca.unwrap_or(certificate)),
                }));
            }
        }
        secret
    }

    /// Generic secret holding one opaque value.
    pub fn generic(name: &str, value: &str) -> Self {
        let mut secret = Self::named(name);
        secret.generic_secret = Some(serde_json::json!({ "secret": inline_string(value) }));
        secret
    }
}

/// `runtime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `extensionConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedExtensionConfig {
    pub name: String,
    #[serde(alias = "typedConfig")]
    pub typed_config: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A decoded resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Endpoint(ClusterLoadAssignment),
    Cluster(Cluster),
    Route(RouteConfiguration),
    ScopedRoute(ScopedRouteConfiguration),
    Listener(Listener),
    Secret(Secret),
    Runtime(Runtime),
    ExtensionConfig(TypedExtensionConfig),
}

fn typed<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::new(e.to_string()))
}

impl Resource {
    /// Decode a JSON value as a resource of the given class.
    pub fn decode(resource_type: ResourceType, value: Value) -> Result<Self, DecodeError> {
        check_fields(resource_type, &value)?;
        Ok(match resource_type {
            ResourceType::Endpoint => Self::Endpoint(typed(value)?),
            ResourceType::Cluster => Self::Cluster(typed(value)?),
            ResourceType::Route => Self::Route(typed(value)?),
            ResourceType::ScopedRoute => Self::ScopedRoute(typed(value)?),
            ResourceType::Listener => Self::Listener(typed(value)?),
            ResourceType::Secret => Self::Secret(typed(value)?),
            ResourceType::Runtime => Self::Runtime(typed(value)?),
            ResourceType::ExtensionConfig => Self::ExtensionConfig(typed(value)?),
        })
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Endpoint(_) => ResourceType::Endpoint,
            Self::Cluster(_) => ResourceType::Cluster,
            Self::Route(_) => ResourceType::Route,
            Self::ScopedRoute(_) => ResourceType::ScopedRoute,
            Self::Listener(_) => ResourceType::Listener,
            Self::Secret(_) => ResourceType::Secret,
            Self::Runtime(_) => ResourceType::Runtime,
            Self::ExtensionConfig(_) => ResourceType::ExtensionConfig,
        }
    }

    /// Identifying name: `cluster_name` for endpoints, `name` otherwise.
    pub fn name(&self) -> &str {
        match self {
            Self::Endpoint(r) => &r.cluster_name,
            Self::Cluster(r) => &r.name,
            Self::Route(r) => &r.name,
            Self::ScopedRoute(r) => &r.name,
            Self::Listener(r) => &r.name,
            Self::Secret(r) => &r.name,
            Self::Runtime(r) => &r.name,
            Self::ExtensionConfig(r) => &r.name,
        }
    }

    /// JSON form with snake_case field names.
    pub fn to_value(&self) -> Value {
        let result = match self {
            Self::Endpoint(r) => serde_json::to_value(r),
            Self::Cluster(r) => serde_json::to_value(r),
            Self::Route(r) => serde_json::to_value(r),
            Self::ScopedRoute(r) => serde_json::to_value(r),
            Self::Listener(r) => serde_json::to_value(r),
            Self::Secret(r) => serde_json::to_value(r),
            Self::Runtime(r) => serde_json::to_value(r),
            Self::ExtensionConfig(r) => serde_json::to_value(r),
        };
        // String-keyed maps of JSON values always serialize.
        result.unwrap_or(Value::Null)
    }

    /// Canonical JSON payload shipped to clients.
    pub fn encode(&self) -> Bytes {
        Bytes::from(canonical_json(&self.to_value()))
    }
}
