//! Error types for the websocket engine.

use thiserror::Error;
use xrpc_core::ErrorObject;

/// Errors observed by callers of the websocket client surface.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("websocket connect failed: {0}")]
    Connect(String),

    /// The engine is gone: stopped, or reconnection was disabled and the
    /// connection died.
    #[error("websocket connection closed")]
    Closed,

    /// The remote replied with an error object. A code-2 object here means
    /// the connection dropped while the call was in flight.
    #[error(transparent)]
    Rpc(ErrorObject),

    #[error("invalid response payload: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    /// A streaming call came back without a channel id in its result slot.
    #[error("streaming response carried no channel id")]
    MissingChannelId,
}
