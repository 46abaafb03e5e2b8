use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codes;

/// JSON-RPC error object carried in the `error` field of a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("method '{}' not found", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(codes::FATAL, message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(codes::APPLICATION, message)
    }

    /// Synthetic error delivered to every in-flight call when the transport
    /// goes away underneath it.
    pub fn connection_closed() -> Self {
        Self::new(
            codes::CONNECTION_CLOSED,
            "handler: websocket connection closed",
        )
    }

    /// Whether the code falls in the JSON-RPC reserved range.
    pub fn is_reserved(&self) -> bool {
        (-32768..=-32000).contains(&self.code)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reserved() {
            write!(f, "RPC error ({}): {}", self.code, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ErrorObject {}

/// Errors surfaced while building the method registry.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("namespace '{0}' is already registered")]
    DuplicateNamespace(String),

    #[error("namespace '{0}' has no methods")]
    EmptyNamespace(String),

    #[error("method '{0}' is already registered")]
    DuplicateMethod(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_range_display() {
        let err = ErrorObject::method_not_found("Svc.Nope");
        assert!(err.is_reserved());
        assert_eq!(
            err.to_string(),
            "RPC error (-32601): method 'Svc.Nope' not found"
        );
    }

    #[test]
    fn test_application_display_is_bare() {
        let err = ErrorObject::application("boom");
        assert!(!err.is_reserved());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_connection_closed_shape() {
        let err = ErrorObject::connection_closed();
        assert_eq!(err.code, codes::CONNECTION_CLOSED);
        assert_eq!(err.message, "handler: websocket connection closed");
    }

    #[test]
    fn test_serialization() {
        let err = ErrorObject::invalid_params("wrong param count");
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"code":-32602,"message":"wrong param count"}"#);
    }
}
