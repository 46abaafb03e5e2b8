//! # Websocket JSON-RPC engine
//!
//! A bidirectional JSON-RPC 2.0 transport over a single websocket. Both
//! peers can issue calls; the engine multiplexes concurrent outgoing calls,
//! incoming calls, server-streamed channel output, remote cancellation and
//! keepalive traffic over one connection. The client side transparently
//! reconnects with backoff.
//!
//! Control traffic uses reserved method names prefixed `xrpc.`:
//! `xrpc.cancel`, `xrpc.ping`, `xrpc.pong`, `xrpc.ch.val`, `xrpc.ch.close`.
//!
//! The one correctness-critical rule is the single-writer discipline: only
//! the writer-and-router task ever touches the socket. Every other producer
//! enqueues frames onto one of two bounded queues (keepalive traffic is
//! kept apart so a burst of streaming data cannot starve it).

pub mod client;
pub mod config;
pub mod conn;
pub mod error;

pub use client::{Subscription, WsClient};
pub use config::{Backoff, WsConfig};
pub use conn::{serve_conn, Io, Latch};
pub use error::WsError;
