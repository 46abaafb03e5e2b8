//! Error types for the HTTP shell and the HTTP call helper.

use thiserror::Error;
use xrpc_core::ErrorObject;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// The remote replied with a JSON-RPC error object.
    #[error(transparent)]
    Rpc(ErrorObject),

    #[error("invalid response body: {0}")]
    InvalidBody(#[from] serde_json::Error),
}
