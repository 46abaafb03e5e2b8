//! The dispatcher: one decoded request in, at most one reply out.
//!
//! Every failure mode turns into a reply frame (or silence, for
//! notifications); nothing here propagates errors to the transport. The
//! transport supplies a one-shot reply writer, a completion callback, and,
//! when it can carry streams, a stream opener.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, warn, Instrument};

use crate::codes;
use crate::error::ErrorObject;
use crate::frame::Frame;
use crate::registry::{CallContext, CallError, CallOutput, Handlers, MethodKind, ValueStream};

/// One-shot writer for the reply frame.
pub type ReplyFn = Box<dyn FnOnce(Frame) -> BoxFuture<'static, ()> + Send>;

/// Completion callback. `keep_context = true` means the call opened a
/// stream and its cancellation must stay armed until the channel closes.
pub type DoneFn = Box<dyn FnOnce(bool) + Send>;

/// Hook handed in by transports that support server-streamed channels.
/// Invoked with the erased source stream and the request id.
pub type StreamOpener =
    Box<dyn FnOnce(ValueStream, i64) -> BoxFuture<'static, Result<(), StreamOpenError>> + Send>;

/// Failure to register a stream with the channel multiplexer, typically
/// because the connection is already draining.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StreamOpenError(pub String);

impl Handlers {
    /// Dispatch one decoded request frame.
    ///
    /// `reply` is invoked at most once and never for notifications. `done`
    /// is invoked exactly once on every path. `open_stream == None` marks a
    /// transport that cannot carry streams; streaming methods then fail
    /// with `-32601`.
    pub async fn handle(
        &self,
        cx: CallContext,
        req: Frame,
        reply: ReplyFn,
        done: DoneFn,
        open_stream: Option<StreamOpener>,
    ) {
        let span = span_for(&req);
        self.handle_inner(cx, req, reply, done, open_stream)
            .instrument(span)
            .await
    }

    async fn handle_inner(
        &self,
        cx: CallContext,
        req: Frame,
        reply: ReplyFn,
        done: DoneFn,
        open_stream: Option<StreamOpener>,
    ) {
        let id = req.id;
        let method = req.method.clone().unwrap_or_default();

        let Some(handler) = self.get(&method) else {
            if let Some(frame) = rpc_error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("method '{}' not found", method),
            ) {
                reply(frame).await;
            }
            done(false);
            return;
        };

        let params = req.params.unwrap_or_default();
        if params.len() != handler.n_params {
            if let Some(frame) = rpc_error(
                id,
                codes::INVALID_PARAMS,
                format!(
                    "wrong param count (method '{}' takes {}, got {})",
                    method,
                    handler.n_params,
                    params.len()
                ),
            ) {
                reply(frame).await;
            }
            done(false);
            return;
        }

        let is_stream = handler.kind == MethodKind::Streaming;
        if is_stream && open_stream.is_none() {
            if let Some(frame) = rpc_error(
                id,
                codes::METHOD_NOT_FOUND,
                format!(
                    "method '{}' not supported in this mode (no out channel support)",
                    method
                ),
            ) {
                reply(frame).await;
            }
            done(false);
            return;
        }

        // From here on `done` reports whether cancellation stays armed for
        // the lifetime of a streaming channel.
        let call = (handler.func)(cx, params);
        let outcome = AssertUnwindSafe(call).catch_unwind().await;

        let out = match outcome {
            Err(panic) => rpc_error(
                id,
                codes::FATAL,
                format!(
                    "fatal error calling '{}': {}",
                    method,
                    panic_message(panic.as_ref())
                ),
            ),
            Ok(Err(CallError::Decode(e))) => rpc_error(
                id,
                codes::PARSE_ERROR,
                format!("decoding params for '{}': {}", method, e),
            ),
            Ok(Err(CallError::App(e))) => rpc_error(id, codes::APPLICATION, e),
            Ok(Ok(CallOutput::Value(value))) => match id {
                None => None,
                Some(id) if value.is_null() => Some(Frame::response_bare(id)),
                Some(id) => match Frame::response_value(id, &value) {
                    Ok(frame) => Some(frame),
                    Err(e) => rpc_error(
                        Some(id),
                        codes::FATAL,
                        format!("encoding result for '{}': {}", method, e),
                    ),
                },
            },
            Ok(Ok(CallOutput::Stream(stream))) => match (id, open_stream) {
                // A notification cannot open a channel; drop the source.
                (None, _) => None,
                (Some(id), Some(opener)) => {
                    // Channel responses are written by the multiplexer task.
                    // Replying here could let channel values overtake the
                    // response that carries their chanId.
                    match opener(stream, id).await {
                        Ok(()) => None,
                        Err(e) => rpc_error(
                            Some(id),
                            codes::APPLICATION,
                            format!("failed to set up channel in call to '{}': {}", method, e),
                        ),
                    }
                }
                (Some(id), None) => rpc_error(
                    Some(id),
                    codes::METHOD_NOT_FOUND,
                    format!("method '{}' not supported in this mode", method),
                ),
            },
        };

        if let Some(frame) = out {
            reply(frame).await;
        }
        done(is_stream);
    }
}

/// Log a call failure and build the reply frame, or `None` for a
/// notification (which never gets a reply, not even an error one).
fn rpc_error(id: Option<i64>, code: i64, message: impl Into<String>) -> Option<Frame> {
    let message = message.into();
    warn!(code, %message, "rpc call failed");
    id.map(move |id| Frame::response_error(id, ErrorObject::new(code, message)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Start a tracing span for the call; a valid base64 `SpanContext` in the
/// request meta is recorded as the remote parent.
fn span_for(req: &Frame) -> tracing::Span {
    let span = tracing::debug_span!(
        "rpc_handle",
        method = %req.method.as_deref().unwrap_or(""),
        parent_context = tracing::field::Empty,
    );
    if let Some(encoded) = req.meta.as_ref().and_then(|m| m.get("SpanContext")) {
        match BASE64.decode(encoded) {
            Ok(_) => {
                span.record("parent_context", encoded.as_str());
            }
            Err(e) => debug!(error = %e, "invalid SpanContext in request meta"),
        }
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::params_from;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    async fn boom(_cx: CallContext, _params: ()) -> Result<Value, Infallible> {
        panic!("kaboom")
    }

    fn test_handlers() -> Handlers {
        let mut handlers = Handlers::new();
        handlers
            .register("Svc", |ns| {
                ns.method("Echo", |_cx, (msg,): (String,)| async move {
                    Ok::<_, Infallible>(msg)
                });
                ns.method("Fail", |_cx, (): ()| async move { Err::<Value, _>("it broke") });
                ns.method("Boom", boom);
                ns.method("Void", |_cx, (): ()| async move {
                    Ok::<_, Infallible>(Value::Null)
                });
                ns.streaming("Tail", |_cx, (): ()| async move {
                    Ok::<_, Infallible>(futures::stream::iter(["x"]))
                });
            })
            .unwrap();
        handlers
    }

    fn cx() -> CallContext {
        CallContext::new()
    }

    fn capture_reply() -> (ReplyFn, oneshot::Receiver<Frame>) {
        let (tx, rx) = oneshot::channel();
        let reply: ReplyFn = Box::new(move |frame| {
            let _ = tx.send(frame);
            futures::future::ready(()).boxed()
        });
        (reply, rx)
    }

    fn capture_done() -> (DoneFn, Arc<Mutex<Option<bool>>>) {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let done: DoneFn = Box::new(move |keep| {
            *out.lock().unwrap() = Some(keep);
        });
        (done, slot)
    }

    #[tokio::test]
    async fn test_echo_call() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, done_slot) = capture_done();

        let req = Frame::request(Some(1), "Svc.Echo", params_from([json!("hi")]));
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        assert_eq!(frame.id, Some(1));
        assert!(frame.error.is_none());
        let result: Value = serde_json::from_str(frame.result.unwrap().get()).unwrap();
        assert_eq!(result, json!("hi"));
        assert_eq!(*done_slot.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, _) = capture_done();

        let req = Frame::request(Some(2), "Svc.Nope", Vec::new());
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        let err = frame.error.unwrap();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert_eq!(err.message, "method 'Svc.Nope' not found");
    }

    #[tokio::test]
    async fn test_wrong_param_count() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, _) = capture_done();

        let req = Frame::request(Some(3), "Svc.Echo", params_from([json!("a"), json!("b")]));
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        let err = frame.error.unwrap();
        assert_eq!(err.code, codes::INVALID_PARAMS);
        assert!(err.message.contains("wrong param count"));
    }

    #[tokio::test]
    async fn test_param_decode_failure() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, _) = capture_done();

        let req = Frame::request(Some(4), "Svc.Echo", params_from([json!(42)]));
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        assert_eq!(frame.error.unwrap().code, codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_application_error() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, _) = capture_done();

        let req = Frame::request(Some(5), "Svc.Fail", Vec::new());
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        let err = frame.error.unwrap();
        assert_eq!(err.code, codes::APPLICATION);
        assert_eq!(err.message, "it broke");
    }

    #[tokio::test]
    async fn test_panic_becomes_fatal_error() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, done_slot) = capture_done();

        let req = Frame::request(Some(6), "Svc.Boom", Vec::new());
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        let err = frame.error.unwrap();
        assert_eq!(err.code, codes::FATAL);
        assert!(err.message.contains("Svc.Boom"));
        assert!(err.message.contains("kaboom"));
        assert_eq!(*done_slot.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_notification_is_silent() {
        let handlers = test_handlers();
        let (reply, mut rx) = capture_reply();
        let (done, _) = capture_done();

        // Even a failing notification produces no reply.
        let req = Frame::notification("Svc.Fail", Vec::new());
        handlers.handle(cx(), req, reply, done, None).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_void_result_omits_result_slot() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, _) = capture_done();

        let req = Frame::request(Some(7), "Svc.Void", Vec::new());
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        assert!(frame.result.is_none());
        assert!(frame.error.is_none());
        assert_eq!(frame.id, Some(7));
    }

    #[tokio::test]
    async fn test_streaming_rejected_without_opener() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, done_slot) = capture_done();

        let req = Frame::request(Some(8), "Svc.Tail", Vec::new());
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        let err = frame.error.unwrap();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert!(err.message.contains("not supported in this mode"));
        assert_eq!(*done_slot.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_span_context_meta_is_tolerated() {
        let handlers = test_handlers();
        let (reply, rx) = capture_reply();
        let (done, _) = capture_done();

        // Valid base64 parent context: the call proceeds normally under the
        // remote-parented span.
        let mut meta = std::collections::HashMap::new();
        meta.insert("SpanContext".to_string(), BASE64.encode([1u8, 2, 3, 4]));
        let req =
            Frame::request(Some(11), "Svc.Echo", params_from([json!("traced")])).with_meta(meta);
        handlers.handle(cx(), req, reply, done, None).await;

        let frame = rx.await.unwrap();
        let result: Value = serde_json::from_str(frame.result.unwrap().get()).unwrap();
        assert_eq!(result, json!("traced"));

        // Garbage base64 is logged and ignored, never an error reply.
        let (reply, rx) = capture_reply();
        let (done, _) = capture_done();
        let mut meta = std::collections::HashMap::new();
        meta.insert("SpanContext".to_string(), "%%%not-base64%%%".to_string());
        let req =
            Frame::request(Some(12), "Svc.Echo", params_from([json!("still ok")])).with_meta(meta);
        handlers.handle(cx(), req, reply, done, None).await;
        assert!(rx.await.unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_streaming_hands_source_to_opener() {
        let handlers = test_handlers();
        let (reply, mut rx) = capture_reply();
        let (done, done_slot) = capture_done();

        let opened = Arc::new(AtomicBool::new(false));
        let opened_flag = Arc::clone(&opened);
        let (items_tx, items_rx) = oneshot::channel();
        let opener: StreamOpener = Box::new(move |stream, req_id| {
            async move {
                assert_eq!(req_id, 9);
                opened_flag.store(true, Ordering::SeqCst);
                let items: Vec<Value> = stream.collect().await;
                let _ = items_tx.send(items);
                Ok(())
            }
            .boxed()
        });

        let req = Frame::request(Some(9), "Svc.Tail", Vec::new());
        handlers.handle(cx(), req, reply, done, Some(opener)).await;

        assert!(opened.load(Ordering::SeqCst));
        assert_eq!(items_rx.await.unwrap(), vec![json!("x")]);
        // The multiplexer owns the reply for streaming calls.
        assert!(rx.try_recv().is_err());
        assert_eq!(*done_slot.lock().unwrap(), Some(true));
    }
}
