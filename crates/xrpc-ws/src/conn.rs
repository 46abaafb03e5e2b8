//! The per-connection state machine.
//!
//! Each live connection runs two tasks: a reader that decodes frames off
//! the socket, and a writer-and-router that owns the socket's write half,
//! the inflight / handling / channel-handler tables, and all frame routing.
//! Dispatching an inbound call spawns a task per call so slow methods never
//! block the router; a lazily-spawned multiplexer task forwards
//! server-streamed channels. All writes from any producer funnel through
//! two bounded queues drained by the router, which keeps the socket
//! single-writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, BoxStream, SelectAll, SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use xrpc_core::dispatch::{DoneFn, ReplyFn, StreamOpenError, StreamOpener};
use xrpc_core::{CallContext, ErrorObject, Frame, Handlers, Param, ValueStream};

use crate::config::WsConfig;

/// Reserved method names carrying engine control traffic.
pub(crate) const METHOD_CANCEL: &str = "xrpc.cancel";
pub(crate) const METHOD_PING: &str = "xrpc.ping";
pub(crate) const METHOD_PONG: &str = "xrpc.pong";
pub(crate) const METHOD_CH_VAL: &str = "xrpc.ch.val";
pub(crate) const METHOD_CH_CLOSE: &str = "xrpc.ch.close";

/// Queue depth for the write, keepalive and inbound frame queues. A full
/// write queue blocks its producer; that is the backpressure mechanism.
const QUEUE_DEPTH: usize = 100;

/// Byte-stream bound satisfied by every websocket flavour the engine runs
/// over (TCP, TLS, in-memory duplex, upgraded HTTP connections).
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// A one-shot connection-lifecycle signal.
///
/// The engine trips one latch per live connection to stop its reader and
/// router, one per engine to mark terminal closure, and one per incoming
/// channel to unwind that channel's cancel propagator. Tripping is
/// idempotent; waiters before and after observe the same level.
#[derive(Debug, Clone, Default)]
pub struct Latch {
    inner: Arc<LatchInner>,
}

#[derive(Debug, Default)]
struct LatchInner {
    set: AtomicBool,
    wake: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch, waking every waiter.
    pub fn set(&self) {
        self.inner.set.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// Resolve once the latch is tripped; immediately if it already is.
    pub async fn wait(&self) {
        // Register before checking, or a set() landing in between would
        // be missed.
        let notified = self.inner.wake.notified();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

/// An outbound call queued by the client surface.
pub(crate) struct ClientRequest {
    pub(crate) frame: Frame,
    /// Receives the response frame; synthesised with a code-2 error when
    /// the connection dies underneath the call.
    pub(crate) ready: oneshot::Sender<Frame>,
    /// For streaming calls: invoked when the response carrying the chanId
    /// arrives, yields the cancellation handle and the value-delivery
    /// callback for that channel.
    pub(crate) stream_hook: Option<StreamHook>,
}

pub(crate) type StreamHook = Box<dyn FnOnce() -> (Latch, ChanHandler) + Send>;

/// Client-side handler for one incoming channel. Called with
/// `(Some(param), true)` per value and once with `(None, false)` when the
/// channel closes or the connection is lost.
pub(crate) type ChanHandler = Box<dyn FnMut(Option<Param>, bool) + Send>;

/// Engine state that survives reconnects.
pub(crate) struct ConnShared {
    pub(crate) handlers: Option<Arc<Handlers>>,
    pub(crate) config: WsConfig,
    pub(crate) is_client: bool,
    /// Explicit stop request: close cleanly, never reconnect.
    pub(crate) stop: Latch,
    /// Parent shutdown signal; tripping it tears the connection down.
    pub(crate) parent: Latch,
}

/// Calls being handled for the remote, keyed by request id. Holds the
/// call contexts so `xrpc.cancel` and connection teardown can cancel them.
type HandlingTable = Arc<parking_lot::Mutex<HashMap<i64, CallContext>>>;

/// Drive one server-side connection to completion.
///
/// Returns once the socket is gone and the shutdown sequence has run:
/// every in-flight call failed with code 2, every handled call cancelled,
/// every incoming channel handler closed.
pub async fn serve_conn<S: Io + 'static>(
    ws: WebSocketStream<S>,
    handlers: Arc<Handlers>,
    config: WsConfig,
    shutdown: Latch,
) {
    let shared = ConnShared {
        handlers: Some(handlers),
        config,
        is_client: false,
        stop: Latch::new(),
        parent: shutdown,
    };
    let (_requests_tx, mut requests_rx) = mpsc::channel(1);
    run_conn(&shared, ws, &mut requests_rx).await;
}

/// Run one live connection. Returns whether the client should reconnect.
pub(crate) async fn run_conn<S: Io + 'static>(
    shared: &ConnShared,
    ws: WebSocketStream<S>,
    requests_rx: &mut mpsc::Receiver<ClientRequest>,
) -> bool {
    let (mut sink, read_half) = ws.split();

    let exit = Latch::new();
    let no_retry = Arc::new(AtomicBool::new(false));

    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(QUEUE_DEPTH);
    let (write_tx, mut write_rx) = mpsc::channel::<Frame>(QUEUE_DEPTH);
    let (keepalive_tx, mut keepalive_rx) = mpsc::channel::<Frame>(QUEUE_DEPTH);
    let (reg_tx, reg_rx) = mpsc::channel::<OutChanReg>(1);

    let handling: HandlingTable = Arc::new(parking_lot::Mutex::new(HashMap::new()));

    let stream_server = Arc::new(StreamServer {
        once: Once::new(),
        reg_rx: parking_lot::Mutex::new(Some(reg_rx)),
        reg_tx,
        write_tx: write_tx.clone(),
        handling: Arc::clone(&handling),
        exit: exit.clone(),
        chan_ctr: AtomicU64::new(0),
    });

    let reader = tokio::spawn(read_loop(
        read_half,
        frame_tx,
        exit.clone(),
        Arc::clone(&no_retry),
        shared.config.read_deadline(),
    ));

    let mut router = Router {
        handlers: shared.handlers.clone(),
        inflight: HashMap::new(),
        chan_handlers: HashMap::new(),
        handling,
        write_tx,
        keepalive_tx,
        stream_server,
        exit: exit.clone(),
    };

    let mut ping_tick = ping_ticker(shared);

    loop {
        tokio::select! {
            _ = shared.parent.wait() => {
                no_retry.store(true, Ordering::SeqCst);
                break;
            }
            _ = exit.wait() => break,
            _ = next_tick(&mut ping_tick) => {
                router.enqueue_keepalive(keepalive_frame(METHOD_PING));
            }
            Some(frame) = keepalive_rx.recv() => {
                if write_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
            Some(frame) = write_rx.recv() => {
                if write_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
            request = requests_rx.recv(), if shared.is_client => {
                match request {
                    Some(request) => {
                        let text = match serde_json::to_string(&request.frame) {
                            Ok(text) => text,
                            Err(e) => {
                                error!(error = %e, "failed to encode outbound request");
                                continue;
                            }
                        };
                        if let Some(id) = request.frame.id {
                            router.inflight.insert(id, request);
                        }
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            error!(error = %e, "write message error");
                            break;
                        }
                    }
                    // Client handle dropped: treat like an explicit stop.
                    None => {
                        close_normal(&mut sink).await;
                        no_retry.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
            Some(frame) = frame_rx.recv() => router.route(frame),
            _ = shared.stop.wait() => {
                close_normal(&mut sink).await;
                no_retry.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    exit.set();
    router.shutdown();
    drop(frame_rx);
    let _ = reader.await;

    shared.is_client
        && !shared.config.no_reconnect
        && !no_retry.load(Ordering::SeqCst)
        && !shared.stop.is_set()
}

#[derive(Debug, Error)]
enum ReadError {
    #[error("read deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Ws(#[from] tungstenite::Error),
}

async fn next_message<S: Io>(
    read_half: &mut SplitStream<WebSocketStream<S>>,
    deadline: Option<Duration>,
) -> Result<Option<WsMessage>, ReadError> {
    let item = match deadline {
        Some(deadline) => tokio::time::timeout(deadline, read_half.next())
            .await
            .map_err(|_| ReadError::Timeout)?,
        None => read_half.next().await,
    };
    match item {
        Some(Ok(message)) => Ok(Some(message)),
        Some(Err(e)) => Err(ReadError::Ws(e)),
        None => Ok(None),
    }
}

/// Reader task: one decoded frame at a time onto the frame queue.
async fn read_loop<S: Io>(
    mut read_half: SplitStream<WebSocketStream<S>>,
    frame_tx: mpsc::Sender<Frame>,
    exit: Latch,
    no_retry: Arc<AtomicBool>,
    read_deadline: Option<Duration>,
) {
    loop {
        let message = tokio::select! {
            _ = exit.wait() => break,
            message = next_message(&mut read_half, read_deadline) => message,
        };

        let data: Vec<u8> = match message {
            Ok(Some(WsMessage::Text(text))) => text.as_str().as_bytes().to_vec(),
            Ok(Some(WsMessage::Binary(data))) => data.to_vec(),
            Ok(Some(WsMessage::Close(frame))) => {
                // A clean close from the peer disables reconnection.
                if frame.map_or(false, |f| f.code == CloseCode::Normal) {
                    no_retry.store(true, Ordering::SeqCst);
                } else {
                    debug!("peer closed connection abnormally");
                }
                break;
            }
            // Protocol-level ping/pong is handled inside tungstenite.
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "read message error");
                break;
            }
        };

        match serde_json::from_slice::<Frame>(&data) {
            Ok(frame) => {
                let delivered = tokio::select! {
                    _ = exit.wait() => false,
                    sent = frame_tx.send(frame) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            // A malformed frame is dropped; it never tears down the
            // connection and never touches the inflight table.
            Err(e) => error!(error = %e, "unmarshaling frame"),
        }
    }
    exit.set();
}

/// The writer-and-router task's state: every table except `handling` is
/// touched only from this task.
struct Router {
    handlers: Option<Arc<Handlers>>,
    /// Calls we sent to the remote, keyed by request id.
    inflight: HashMap<i64, ClientRequest>,
    /// Client-side handlers for server-fed channels, keyed by chanId.
    chan_handlers: HashMap<u64, IncomingChan>,
    /// Calls we are handling for the remote; shared with dispatcher tasks.
    handling: HandlingTable,
    write_tx: mpsc::Sender<Frame>,
    keepalive_tx: mpsc::Sender<Frame>,
    stream_server: Arc<StreamServer>,
    exit: Latch,
}

struct IncomingChan {
    deliver: ChanHandler,
    /// Tripped when the channel closes, so the cancel propagator for this
    /// stream does not outlive it.
    closed: Latch,
}

impl Router {
    /// Route one inbound frame by its method field: absent means a
    /// response to our call, `xrpc.*` is engine control traffic, anything
    /// else is an incoming remote call.
    fn route(&mut self, frame: Frame) {
        match frame.method.as_deref() {
            None | Some("") => self.handle_response(frame),
            Some(METHOD_CANCEL) => self.cancel_call(&frame),
            Some(METHOD_PING) => self.enqueue_keepalive(keepalive_frame(METHOD_PONG)),
            Some(METHOD_PONG) => {}
            Some(METHOD_CH_VAL) => self.chan_value(frame),
            Some(METHOD_CH_CLOSE) => self.chan_close(&frame),
            Some(_) => self.handle_call(frame),
        }
    }

    /// Keepalive frames are produced by this task and drained by it too, so
    /// a blocking send could deadlock; drop on full instead. A dropped ping
    /// is superseded by the next tick, a dropped pong by the peer's next
    /// ping.
    fn enqueue_keepalive(&self, frame: Frame) {
        if self.keepalive_tx.try_send(frame).is_err() {
            warn!("keepalive queue full, dropping frame");
        }
    }

    /// A response to one of our calls.
    fn handle_response(&mut self, frame: Frame) {
        let Some(id) = frame.id else {
            warn!("response frame without id");
            return;
        };
        let Some(mut request) = self.inflight.remove(&id) else {
            error!(id, "got response for unknown request id");
            return;
        };

        if let Some(hook) = request.stream_hook.take() {
            if let Some(result) = frame.result.as_deref() {
                // The result of a streaming call is the server-allocated
                // channel id.
                match serde_json::from_str::<u64>(result.get()) {
                    Ok(chan_id) => self.open_incoming_chan(chan_id, id, hook),
                    Err(e) => {
                        error!(error = %e, raw = result.get(), "failed to decode channel id in response")
                    }
                }
            }
        }

        let _ = request.ready.send(frame);
    }

    fn open_incoming_chan(&mut self, chan_id: u64, req_id: i64, hook: StreamHook) {
        let (cancel, deliver) = hook();
        let closed = Latch::new();
        self.chan_handlers.insert(
            chan_id,
            IncomingChan {
                deliver,
                closed: closed.clone(),
            },
        );

        // Propagate caller-side cancellation to the remote. The task is
        // also tied to the channel's close so it cannot accumulate across
        // many short-lived streams.
        let write_tx = self.write_tx.clone();
        let exit = self.exit.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.wait() => {
                    let frame =
                        Frame::notification(METHOD_CANCEL, vec![Param::from_value(req_id.into())]);
                    let _ = write_tx.send(frame).await;
                }
                _ = closed.wait() => {}
                _ = exit.wait() => {}
            }
        });
    }

    /// Builtin `xrpc.cancel`: cancel a call we are handling. Safe to
    /// receive more than once; after the first the entry is simply gone.
    fn cancel_call(&self, frame: &Frame) {
        if frame.id.is_some() {
            warn!("xrpc.cancel arrived with an id set, not responding");
        }
        let Some(id) = frame.param(0).and_then(|p| p.decode::<i64>().ok()) else {
            error!("xrpc.cancel without a request id param");
            return;
        };
        if let Some(ctx) = self.handling.lock().get(&id) {
            ctx.cancel();
        }
    }

    /// Builtin `xrpc.ch.val`: one value for a client-side channel.
    fn chan_value(&mut self, frame: Frame) {
        let Some(chan_id) = frame.param(0).and_then(|p| p.decode::<u64>().ok()) else {
            error!("xrpc.ch.val without a channel id");
            return;
        };
        let Some(chan) = self.chan_handlers.get_mut(&chan_id) else {
            error!(chan_id, "xrpc.ch.val: handler not found");
            return;
        };
        let payload = frame.params.as_ref().and_then(|p| p.get(1)).cloned();
        (chan.deliver)(payload, true);
    }

    /// Builtin `xrpc.ch.close`: final delivery, then drop the handler.
    fn chan_close(&mut self, frame: &Frame) {
        let Some(chan_id) = frame.param(0).and_then(|p| p.decode::<u64>().ok()) else {
            error!("xrpc.ch.close without a channel id");
            return;
        };
        let Some(mut chan) = self.chan_handlers.remove(&chan_id) else {
            error!(chan_id, "xrpc.ch.close: handler not found");
            return;
        };
        (chan.deliver)(None, false);
        chan.closed.set();
    }

    /// An incoming remote call: arm cancellation, then dispatch on its own
    /// task so the router never blocks on a slow method.
    fn handle_call(&mut self, frame: Frame) {
        let Some(handlers) = self.handlers.clone() else {
            error!(
                method = frame.method.as_deref().unwrap_or(""),
                "incoming call but no handlers registered"
            );
            return;
        };

        let cx = CallContext::new();

        let done: DoneFn = match frame.id {
            Some(id) => {
                self.handling.lock().insert(id, cx.clone());
                let handling = Arc::clone(&self.handling);
                let ctx = cx.clone();
                Box::new(move |keep_context| {
                    if !keep_context {
                        ctx.cancel();
                        handling.lock().remove(&id);
                    }
                })
            }
            None => {
                let ctx = cx.clone();
                Box::new(move |keep_context| {
                    if !keep_context {
                        ctx.cancel();
                    }
                })
            }
        };

        let reply: ReplyFn = {
            let write_tx = self.write_tx.clone();
            Box::new(move |frame| {
                async move {
                    if write_tx.send(frame).await.is_err() {
                        debug!("dropping reply, connection closing");
                    }
                }
                .boxed()
            })
        };

        let opener: StreamOpener = {
            let stream_server = Arc::clone(&self.stream_server);
            Box::new(move |source, req_id| {
                async move { stream_server.open(source, req_id).await }.boxed()
            })
        };

        tokio::spawn(async move {
            handlers.handle(cx, frame, reply, done, Some(opener)).await;
        });
    }

    /// The shutdown sequence: every pending call observes exactly one
    /// synthetic code-2 failure, every handled call is cancelled, every
    /// incoming channel handler gets its final `(None, false)`.
    fn shutdown(&mut self) {
        for (id, request) in self.inflight.drain() {
            let frame = Frame::response_error(id, ErrorObject::connection_closed());
            let _ = request.ready.send(frame);
        }

        let pending: Vec<CallContext> = self.handling.lock().drain().map(|(_, cx)| cx).collect();
        for ctx in pending {
            ctx.cancel();
        }

        for (_, mut chan) in self.chan_handlers.drain() {
            (chan.deliver)(None, false);
            chan.closed.set();
        }
    }
}

/// Registration of one server-side outgoing channel.
struct OutChanReg {
    req_id: i64,
    chan_id: u64,
    source: ValueStream,
}

/// Server-side entry point for streaming calls; shared with dispatcher
/// tasks through the stream opener.
struct StreamServer {
    once: Once,
    reg_rx: parking_lot::Mutex<Option<mpsc::Receiver<OutChanReg>>>,
    reg_tx: mpsc::Sender<OutChanReg>,
    write_tx: mpsc::Sender<Frame>,
    handling: HandlingTable,
    exit: Latch,
    /// chanIds are monotonically increasing per connection, starting at 1.
    chan_ctr: AtomicU64,
}

impl StreamServer {
    /// Register `source` for forwarding to the peer under a fresh chanId.
    async fn open(self: Arc<Self>, source: ValueStream, req_id: i64) -> Result<(), StreamOpenError> {
        self.ensure_mux();
        let chan_id = self.chan_ctr.fetch_add(1, Ordering::Relaxed) + 1;
        let registration = OutChanReg {
            req_id,
            chan_id,
            source,
        };
        tokio::select! {
            sent = self.reg_tx.send(registration) => {
                sent.map_err(|_| StreamOpenError("connection closing".into()))
            }
            _ = self.exit.wait() => Err(StreamOpenError("connection closing".into())),
        }
    }

    /// Spawn the multiplexer on the first streaming call of the connection.
    fn ensure_mux(&self) {
        self.once.call_once(|| {
            if let Some(reg_rx) = self.reg_rx.lock().take() {
                tokio::spawn(mux_loop(
                    reg_rx,
                    self.write_tx.clone(),
                    Arc::clone(&self.handling),
                    self.exit.clone(),
                ));
            }
        });
    }
}

enum MuxEvent {
    Value(u64, Value),
    Closed { chan_id: u64, req_id: i64 },
}

/// The streaming channel multiplexer: a dynamic set of homogeneous value
/// streams plus the registration channel. Each source is tagged with its
/// chanId and chained with a terminal close marker, so exhaustion is
/// observed in-band and the close notification is guaranteed to be the
/// last frame for that chanId.
async fn mux_loop(
    mut reg_rx: mpsc::Receiver<OutChanReg>,
    write_tx: mpsc::Sender<Frame>,
    handling: HandlingTable,
    exit: Latch,
) {
    let mut sources: SelectAll<BoxStream<'static, MuxEvent>> = SelectAll::new();

    loop {
        tokio::select! {
            _ = exit.wait() => return,
            registration = reg_rx.recv() => {
                let Some(registration) = registration else {
                    warn!("channel registration source closed");
                    return;
                };
                // The chanId response must reach the peer before any
                // ch.val for that id; both ride the same FIFO write queue.
                let response = match Frame::response_value(registration.req_id, &registration.chan_id) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %e, "failed to encode channel id response");
                        continue;
                    }
                };
                if write_tx.send(response).await.is_err() {
                    return;
                }

                let chan_id = registration.chan_id;
                let req_id = registration.req_id;
                let tagged = registration
                    .source
                    .map(move |value| MuxEvent::Value(chan_id, value))
                    .chain(stream::once(async move { MuxEvent::Closed { chan_id, req_id } }));
                sources.push(Box::pin(tagged));
            }
            Some(event) = sources.next(), if !sources.is_empty() => {
                let frame = match event {
                    MuxEvent::Value(chan_id, value) => Frame::notification(
                        METHOD_CH_VAL,
                        vec![Param::from_value(chan_id.into()), Param::from_value(value)],
                    ),
                    MuxEvent::Closed { chan_id, req_id } => {
                        // The stream is done; release the cancellation that
                        // was retained for its lifetime.
                        if let Some(ctx) = handling.lock().remove(&req_id) {
                            ctx.cancel();
                        }
                        Frame::notification(
                            METHOD_CH_CLOSE,
                            vec![Param::from_value(chan_id.into())],
                        )
                    }
                };
                if write_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn keepalive_frame(method: &str) -> Frame {
    Frame::notification(
        method,
        vec![Param::from_value(Value::String(Utc::now().to_rfc3339()))],
    )
}

fn ping_ticker(shared: &ConnShared) -> Option<tokio::time::Interval> {
    match (shared.is_client, shared.config.ping_interval) {
        (true, Some(period)) => {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        }
        _ => None,
    }
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures_util::future::pending().await,
    }
}

async fn write_frame<S: Io>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    frame: &Frame,
) -> Result<(), ()> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            // Drop the frame rather than the connection.
            error!(error = %e, "failed to encode frame");
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(text.into())).await.map_err(|e| {
        error!(error = %e, "write message error");
    })
}

async fn close_normal<S: Io>(sink: &mut SplitSink<WebSocketStream<S>, WsMessage>) {
    let close = WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "stop".into(),
    }));
    if let Err(e) = sink.send(close).await {
        warn!(error = %e, "failed to write close message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latch_releases_current_and_late_waiters() {
        let latch = Latch::new();
        let observer = latch.clone();
        let waiter = tokio::spawn(async move { observer.wait().await });

        assert!(!latch.is_set());
        latch.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();

        // Late waiters see the level, not an edge.
        tokio::time::timeout(Duration::from_millis(10), latch.wait())
            .await
            .expect("late waiter should not block");
    }
}
