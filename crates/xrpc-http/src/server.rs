//! The HTTP shell: stateless single-frame dispatch plus websocket upgrade.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use xrpc_core::dispatch::{DoneFn, ReplyFn};
use xrpc_core::{CallContext, ErrorObject, Frame, Handlers};
use xrpc_ws::{serve_conn, Latch, WsConfig};

use crate::error::HttpError;

/// Configuration for the HTTP shell.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: SocketAddr,
    /// Path of the single-frame POST endpoint. Upgrade requests are
    /// accepted on any path.
    pub rpc_path: String,
    /// Apply wide-open CORS headers to every response.
    pub enable_cors: bool,
    /// Maximum request body size.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".parse().unwrap(),
            rpc_path: "/rpc".to_string(),
            enable_cors: true,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

/// Builder for the HTTP shell.
pub struct HttpRpcServerBuilder {
    config: ServerConfig,
    ws_config: WsConfig,
    handlers: Handlers,
}

impl HttpRpcServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            ws_config: WsConfig::default(),
            handlers: Handlers::new(),
        }
    }

    pub fn bind_address(mut self, address: SocketAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    pub fn rpc_path(mut self, path: impl Into<String>) -> Self {
        self.config.rpc_path = path.into();
        self
    }

    pub fn cors(mut self, enable: bool) -> Self {
        self.config.enable_cors = enable;
        self
    }

    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Engine configuration for upgraded websocket connections.
    pub fn ws_config(mut self, config: WsConfig) -> Self {
        self.ws_config = config;
        self
    }

    /// The shared method registry. Both transports dispatch through it
    /// with the same case-sensitive name lookup.
    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn build(self) -> HttpRpcServer {
        HttpRpcServer {
            inner: Arc::new(ServerInner {
                config: self.config,
                ws_config: self.ws_config,
                handlers: Arc::new(self.handlers),
                shutdown: Latch::new(),
            }),
        }
    }
}

impl Default for HttpRpcServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The HTTP shell server.
#[derive(Clone)]
pub struct HttpRpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    ws_config: WsConfig,
    handlers: Arc<Handlers>,
    shutdown: Latch,
}

impl HttpRpcServer {
    pub fn builder() -> HttpRpcServerBuilder {
        HttpRpcServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Tear down every websocket connection served by this shell.
    pub fn shutdown(&self) {
        self.inner.shutdown.set();
    }

    /// Accept and serve connections forever.
    pub async fn run(&self) -> Result<(), HttpError> {
        let listener = TcpListener::bind(self.inner.config.bind_address).await?;
        info!(address = %self.inner.config.bind_address, "rpc server listening");
        info!(path = %self.inner.config.rpc_path, "rpc endpoint available");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!(peer = %peer_addr, "new connection");

            let server = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    let message = err.to_string();
                    // Clients hanging up mid-request is routine, not an error.
                    if message.contains("connection closed before message completed") {
                        debug!("client disconnected: {}", message);
                    } else {
                        error!("error serving connection: {}", message);
                    }
                }
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let mut response = if is_upgrade_request(&req) {
            self.handle_ws_upgrade(req)
        } else if req.method() == Method::POST && req.uri().path() == self.inner.config.rpc_path {
            self.handle_rpc(req).await?
        } else if req.method() == Method::OPTIONS {
            // CORS preflight; the headers are attached below.
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(Bytes::new()))
                .unwrap()
        } else {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()
        };

        if self.inner.config.enable_cors {
            apply_cors_headers(response.headers_mut());
        }
        Ok(response)
    }

    /// Promote the request to a websocket and hand it to the engine.
    fn handle_ws_upgrade(&self, mut req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from("missing Sec-WebSocket-Key")))
                .unwrap();
        };
        let accept_key = derive_accept_key(key.as_bytes());
        let protocol = req.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();

        let handlers = Arc::clone(&self.inner.handlers);
        let ws_config = self.inner.ws_config.clone();
        let shutdown = self.inner.shutdown.clone();
        let upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    let ws = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    serve_conn(ws, handlers, ws_config, shutdown).await;
                }
                Err(e) => error!(error = %e, "websocket upgrade failed"),
            }
        });

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, accept_key);
        if let Some(protocol) = protocol {
            response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        response.body(Full::new(Bytes::new())).unwrap()
    }

    async fn handle_rpc(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let body = req.into_body().collect().await?.to_bytes();
        if body.len() > self.inner.config.max_body_size {
            warn!(size = body.len(), "request body too large");
            return Ok(Response::builder()
                .status(StatusCode::PAYLOAD_TOO_LARGE)
                .body(Full::new(Bytes::from("request body too large")))
                .unwrap());
        }

        let (status, reply) = dispatch_frame(&self.inner.handlers, &body).await;
        Ok(Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(reply))
            .unwrap())
    }
}

/// Decode one request frame, dispatch it statelessly, encode one response.
///
/// Any RPC-level failure keeps HTTP status 500 while the body remains a
/// valid JSON-RPC response object. Notifications produce an empty 200.
/// Streaming methods are dispatched with no stream opener and come back as
/// `-32601`.
pub(crate) async fn dispatch_frame(handlers: &Handlers, body: &[u8]) -> (StatusCode, Bytes) {
    let frame: Frame = match serde_json::from_slice(body) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "unmarshaling request");
            let reply = Frame {
                jsonrpc: xrpc_core::JSONRPC_VERSION.to_string(),
                id: None,
                method: None,
                params: None,
                result: None,
                error: Some(ErrorObject::parse_error(format!(
                    "unmarshaling request: {}",
                    e
                ))),
                meta: None,
            };
            let body = serde_json::to_vec(&reply).unwrap_or_default();
            return (StatusCode::INTERNAL_SERVER_ERROR, Bytes::from(body));
        }
    };

    let (reply_tx, mut reply_rx) = oneshot::channel();
    let reply: ReplyFn = Box::new(move |frame| {
        let _ = reply_tx.send(frame);
        Box::pin(async {})
    });
    let done: DoneFn = Box::new(|_keep_context| {});

    handlers
        .handle(CallContext::new(), frame, reply, done, None)
        .await;

    match reply_rx.try_recv() {
        Ok(reply) => {
            let status = if reply.error.is_some() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            match serde_json::to_vec(&reply) {
                Ok(body) => (status, Bytes::from(body)),
                Err(e) => {
                    error!(error = %e, "failed to encode response");
                    (StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
                }
            }
        }
        // Notification: nothing to say.
        Err(_) => (StatusCode::OK, Bytes::new()),
    }
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
}

/// Wide-open CORS for the one surface this shell exposes: a JSON POST
/// endpoint and its OPTIONS preflight. Upgrade requests bypass CORS
/// entirely, so no other methods or headers need allowing.
fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
}
