//! # HTTP shell for the xrpc runtime
//!
//! A thin hyper 1.x server over the shared method registry: one endpoint
//! accepts a POST of a single request frame and dispatches it statelessly;
//! any request carrying `Connection: upgrade` is promoted to a websocket
//! and handed to the full engine in server mode. CORS is wide open.
//!
//! Streaming methods are not reachable over plain HTTP; calling one yields
//! `-32601` just like an unknown method.

pub mod client;
pub mod error;
pub mod server;

pub use client::HttpClient;
pub use error::HttpError;
pub use server::{HttpRpcServer, HttpRpcServerBuilder, ServerConfig};
