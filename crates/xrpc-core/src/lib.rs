//! # JSON-RPC 2.0 Core
//!
//! Transport-agnostic JSON-RPC 2.0 runtime core with clean protocol/dispatch
//! separation. This crate provides the wire frame codec, the method registry
//! and the dispatcher without any transport-specific code.
//!
//! ## Architecture
//!
//! - [`Frame`] is the single wire shape shared by requests, notifications and
//!   responses. Streaming control traffic reuses the same shape.
//! - [`Param`] defers argument parsing until the target method's parameter
//!   types are known.
//! - [`Handlers`] maps `"<namespace>.<Method>"` to an erased, typed closure
//!   built at registration time, and drives the dispatch pipeline for one
//!   decoded request.
//!
//! Transports (HTTP, websocket) sit on top: they decode one [`Frame`], hand
//! it to [`Handlers::handle`], and write whatever reply comes back.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod registry;

pub use dispatch::{DoneFn, ReplyFn, StreamOpenError, StreamOpener};
pub use error::{ErrorObject, RegisterError};
pub use frame::{params_from, Frame, Param};
pub use registry::{
    CallContext, CallError, CallOutput, Handlers, MethodKind, Namespace, RpcParams, ValueStream,
};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes used on the wire.
///
/// The reserved JSON-RPC range is `[-32768, -32000]`; small positive codes
/// are runtime-specific.
pub mod codes {
    /// A frame or parameter failed to parse.
    pub const PARSE_ERROR: i64 = -32700;
    /// Unknown method, or a streaming method called on a transport that
    /// cannot carry streams.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Positional parameter count did not match the registration.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Fatal call error: the method panicked or dispatch itself broke.
    pub const FATAL: i64 = 0;
    /// Application error returned by the method.
    pub const APPLICATION: i64 = 1;
    /// The connection closed while the call was in flight.
    pub const CONNECTION_CLOSED: i64 = 2;
}
