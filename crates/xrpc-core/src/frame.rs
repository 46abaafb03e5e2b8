//! The unified wire frame and the deferred-decode parameter container.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::error::ErrorObject;
use crate::JSONRPC_VERSION;

/// One JSON object on the wire.
///
/// A frame with a `method` is a request, or a notification when `id` is
/// absent. A frame without a method and with an `id` is a response. The
/// streaming channel sub-protocol reuses this shape; there is no separate
/// envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Param>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, String>>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl Frame {
    /// Build a request frame. `id = None` makes it a notification.
    pub fn request(id: Option<i64>, method: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: Some(method.into()),
            params: if params.is_empty() { None } else { Some(params) },
            result: None,
            error: None,
            meta: None,
        }
    }

    /// Build a notification frame (a request without an id).
    pub fn notification(method: impl Into<String>, params: Vec<Param>) -> Self {
        Self::request(None, method, params)
    }

    /// Build an error response.
    pub fn response_error(id: i64, error: ErrorObject) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
            meta: None,
        }
    }

    /// Build a success response carrying `value` in the result slot.
    pub fn response_value<T: Serialize>(id: i64, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(RawValue::from_string(serde_json::to_string(value)?)?),
            error: None,
            meta: None,
        })
    }

    /// Build a success response with no result slot.
    pub fn response_bare(id: i64) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: None,
            meta: None,
        }
    }

    /// Whether this frame is a request that expects no reply.
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Positional parameter at `index`, if present.
    pub fn param(&self, index: usize) -> Option<&Param> {
        self.params.as_ref()?.get(index)
    }

    /// Attach a meta map (e.g. a propagated `SpanContext`).
    pub fn with_meta(mut self, meta: HashMap<String, String>) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A single positional parameter.
///
/// Inbound params keep the raw bytes of the JSON value as received so that
/// decoding can wait until the target method's parameter types are known.
/// Outbound params built locally carry an in-memory value instead. Decoding
/// uses the bytes; encoding prefers the in-memory value.
#[derive(Debug, Clone)]
pub struct Param {
    raw: Option<Box<RawValue>>,
    value: Option<Value>,
}

impl Param {
    /// Wrap a locally-constructed value for an outbound frame.
    pub fn from_value(value: Value) -> Self {
        Self {
            raw: None,
            value: Some(value),
        }
    }

    /// Decode into the declared parameter type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match (&self.raw, &self.value) {
            (Some(raw), _) => serde_json::from_str(raw.get()),
            (None, Some(value)) => serde_json::from_value(value.clone()),
            (None, None) => serde_json::from_value(Value::Null),
        }
    }

    /// The raw JSON bytes, when this param arrived off the wire.
    pub fn as_raw(&self) -> Option<&RawValue> {
        self.raw.as_deref()
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl Serialize for Param {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(value) = &self.value {
            value.serialize(serializer)
        } else if let Some(raw) = &self.raw {
            raw.serialize(serializer)
        } else {
            serializer.serialize_unit()
        }
    }
}

impl<'de> Deserialize<'de> for Param {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Ok(Self {
            raw: Some(raw),
            value: None,
        })
    }
}

/// Convenience: turn plain JSON values into a positional param list.
pub fn params_from<I: IntoIterator<Item = Value>>(values: I) -> Vec<Param> {
    values.into_iter().map(Param::from_value).collect()
}
