//! The client call surface and the reconnecting connection loop.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use xrpc_core::{params_from, Frame, Handlers};

use crate::config::WsConfig;
use crate::conn::{run_conn, ChanHandler, ClientRequest, ConnShared, Io, Latch, StreamHook};
use crate::error::WsError;

/// A websocket JSON-RPC client.
///
/// Wraps outbound calls so user code sees an ordinary call-by-method-name
/// surface; the engine behind it multiplexes concurrent calls, streams and
/// keepalive over one connection and reconnects transparently unless
/// configured otherwise. When the connection drops, every in-flight call
/// fails exactly once with a code-2 error; nothing is replayed, because the
/// remote may already have executed the call.
pub struct WsClient {
    requests_tx: mpsc::Sender<ClientRequest>,
    id_counter: AtomicI64,
    stop: Latch,
    closed: Latch,
}

impl WsClient {
    /// Dial a `ws://` address and run the engine until stopped.
    ///
    /// `handlers` may be supplied so the server can call back into this
    /// client over the same connection.
    pub async fn connect(
        addr: &str,
        handlers: Option<Arc<Handlers>>,
        config: WsConfig,
    ) -> Result<Self, WsError> {
        let addr = addr.to_string();
        Self::with_factory(
            move || {
                let addr = addr.clone();
                async move {
                    let (ws, _response) = tokio_tungstenite::connect_async(addr)
                        .await
                        .map_err(|e| WsError::Connect(e.to_string()))?;
                    Ok(ws)
                }
            },
            handlers,
            config,
        )
        .await
    }

    /// Run the engine over connections produced by `factory`, which is
    /// invoked for the initial connection and again on every reconnect.
    pub async fn with_factory<S, F, Fut>(
        mut factory: F,
        handlers: Option<Arc<Handlers>>,
        config: WsConfig,
    ) -> Result<Self, WsError>
    where
        S: Io + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<WebSocketStream<S>, WsError>> + Send + 'static,
    {
        // Initial connection failures surface to the caller; only later
        // drops go through the retry loop.
        let first = factory().await?;

        let (requests_tx, requests_rx) = mpsc::channel(16);
        let stop = Latch::new();
        let closed = Latch::new();
        let shared = ConnShared {
            handlers,
            config,
            is_client: true,
            stop: stop.clone(),
            parent: Latch::new(),
        };

        tokio::spawn(connection_loop(
            shared,
            first,
            factory,
            requests_rx,
            closed.clone(),
        ));

        Ok(Self {
            requests_tx,
            id_counter: AtomicI64::new(0),
            stop,
            closed,
        })
    }

    /// Call `method` with positional `params` and await the result.
    ///
    /// A remote failure comes back as [`WsError::Rpc`]; a connection lost
    /// mid-call yields an `Rpc` error with code 2, exactly once.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, WsError> {
        let frame = self.roundtrip(method, params, None).await?;
        if let Some(error) = frame.error {
            return Err(WsError::Rpc(error));
        }
        match frame.result {
            Some(raw) => Ok(serde_json::from_str(raw.get())?),
            None => Ok(Value::Null),
        }
    }

    /// Fire a notification. No reply will ever arrive.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), WsError> {
        let (ready, _discard) = oneshot::channel();
        let request = ClientRequest {
            frame: Frame::request(None, method, params_from(params)),
            ready,
            stream_hook: None,
        };
        self.requests_tx
            .send(request)
            .await
            .map_err(|_| WsError::Closed)
    }

    /// Issue a streaming call and subscribe to its server-fed channel.
    ///
    /// The response carries a server-allocated chanId; each `xrpc.ch.val`
    /// for it is decoded and delivered in order, and the subscription ends
    /// on `xrpc.ch.close` or connection loss.
    pub async fn subscribe(&self, method: &str, params: Vec<Value>) -> Result<Subscription, WsError> {
        let cancel = Latch::new();
        let (values_tx, values_rx) = mpsc::unbounded_channel();

        let hook_cancel = cancel.clone();
        let hook: StreamHook = Box::new(move || {
            let deliver: ChanHandler = Box::new(move |param, ok| {
                if !ok {
                    // Final delivery; dropping this closure closes the
                    // receiver.
                    return;
                }
                let Some(param) = param else { return };
                match param.decode::<Value>() {
                    Ok(value) => {
                        let _ = values_tx.send(value);
                    }
                    Err(e) => warn!(error = %e, "failed to decode channel value"),
                }
            });
            (hook_cancel, deliver)
        });

        let frame = self.roundtrip(method, params, Some(hook)).await?;
        if let Some(error) = frame.error {
            return Err(WsError::Rpc(error));
        }
        if frame.result.is_none() {
            return Err(WsError::MissingChannelId);
        }
        Ok(Subscription { values_rx, cancel })
    }

    /// Request a clean shutdown: a normal close frame is written and no
    /// reconnect is attempted.
    pub fn stop(&self) {
        self.stop.set();
    }

    /// Resolve once the engine has terminally shut down.
    pub async fn closed(&self) {
        self.closed.wait().await
    }

    fn next_id(&self) -> i64 {
        self.id_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn roundtrip(
        &self,
        method: &str,
        params: Vec<Value>,
        stream_hook: Option<StreamHook>,
    ) -> Result<Frame, WsError> {
        let id = self.next_id();
        let (ready, reply) = oneshot::channel();
        let request = ClientRequest {
            frame: Frame::request(Some(id), method, params_from(params)),
            ready,
            stream_hook,
        };
        self.requests_tx
            .send(request)
            .await
            .map_err(|_| WsError::Closed)?;
        reply.await.map_err(|_| WsError::Closed)
    }
}

/// A live server-fed channel on the client side.
pub struct Subscription {
    values_rx: mpsc::UnboundedReceiver<Value>,
    cancel: Latch,
}

impl Subscription {
    /// Next value from the channel, in server order. `None` once the
    /// server closed the channel or the connection went away.
    pub async fn next(&mut self) -> Option<Value> {
        self.values_rx.recv().await
    }

    /// Ask the remote to cancel the producing call.
    pub fn cancel(&self) {
        self.cancel.set();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.set();
    }
}

/// One engine lifetime: run a connection, then redial with linear backoff
/// for as long as reconnection is permitted. Fresh tables every attempt;
/// the preceding shutdown already failed whatever was in flight.
async fn connection_loop<S, F, Fut>(
    shared: ConnShared,
    first: WebSocketStream<S>,
    mut factory: F,
    mut requests_rx: mpsc::Receiver<ClientRequest>,
    closed: Latch,
) where
    S: Io + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<WebSocketStream<S>, WsError>> + Send + 'static,
{
    let mut conn = first;
    loop {
        let retry = run_conn(&shared, conn, &mut requests_rx).await;
        if !retry {
            break;
        }

        let mut attempt: u32 = 0;
        conn = loop {
            let delay = shared.config.reconnect_backoff.delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shared.stop.wait() => {
                    closed.set();
                    return;
                }
            }
            match factory().await {
                Ok(ws) => {
                    info!(attempt, "websocket reconnected");
                    break ws;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "websocket reconnect failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        };
    }
    closed.set();
}
