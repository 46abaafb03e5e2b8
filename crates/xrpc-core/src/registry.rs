//! The method registry: `"<namespace>.<Method>"` to dispatch descriptors.
//!
//! Registration erases each typed handler into a closure
//! `(CallContext, Vec<Param>) -> future` so that dispatch stays uniform.
//! Parameter types are recovered at registration time through the
//! [`RpcParams`] tuple bound; argument decoding happens inside the closure,
//! after the dispatcher has checked the method name and arity.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::RegisterError;
use crate::frame::Param;

/// Context handed to every registered method.
///
/// Clones share one cancellation state: the transport keeps a clone keyed
/// by request id while the method runs with another. The peer's
/// `xrpc.cancel`, connection teardown and the transport's own shutdown all
/// resolve to [`CallContext::cancel`]; the method observes it at its next
/// await point.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    state: Arc<CallState>,
}

#[derive(Debug, Default)]
struct CallState {
    cancelled: AtomicBool,
    wake: Notify,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the call. Repeated cancels are no-ops; waiters past and
    /// future all observe the same level.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.wake.notify_waiters();
    }

    /// Whether the call has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once the call is cancelled; immediately if it already was.
    pub async fn cancelled(&self) {
        // Register before checking the flag: a cancel landing between the
        // check and the await would otherwise be missed.
        let notified = self.state.wake.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// A server-streamed source, erased to JSON values.
pub type ValueStream = BoxStream<'static, Value>;

/// What a method call produced.
pub enum CallOutput {
    /// A single value for the result slot. `Null` omits the slot, matching
    /// methods that only have an error return.
    Value(Value),
    /// A stream of values to forward over a server-allocated channel.
    Stream(ValueStream),
}

/// Why a call failed inside the handler closure.
pub enum CallError {
    /// A positional parameter did not decode into its declared type.
    Decode(String),
    /// The method returned its error slot.
    App(String),
}

type HandlerFn = Arc<
    dyn Fn(CallContext, Vec<Param>) -> BoxFuture<'static, Result<CallOutput, CallError>>
        + Send
        + Sync,
>;

/// Whether a method replies once or opens a server-streamed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    Streaming,
}

/// Immutable dispatch descriptor for one registered method.
#[derive(Clone)]
pub struct MethodHandler {
    pub(crate) n_params: usize,
    pub(crate) kind: MethodKind,
    pub(crate) func: HandlerFn,
}

impl MethodHandler {
    /// Declared positional parameter count.
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }
}

/// The registry: a flat, case-sensitive map of method name to descriptor.
///
/// Both transports share one lookup policy; names are never normalised.
#[derive(Default, Clone)]
pub struct Handlers {
    methods: HashMap<String, MethodHandler>,
    namespaces: HashSet<String>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under `namespace`.
    ///
    /// The builder closure adds the service's methods; method names on the
    /// wire are `"<namespace>.<Method>"`. Fails on a duplicate namespace, a
    /// namespace that registers no methods, or a duplicate method name.
    pub fn register<F>(&mut self, namespace: &str, build: F) -> Result<(), RegisterError>
    where
        F: FnOnce(&mut Namespace<'_>),
    {
        if self.namespaces.contains(namespace) {
            return Err(RegisterError::DuplicateNamespace(namespace.to_string()));
        }

        let mut ns = Namespace {
            namespace,
            methods: Vec::new(),
        };
        build(&mut ns);

        if ns.methods.is_empty() {
            return Err(RegisterError::EmptyNamespace(namespace.to_string()));
        }
        for (name, _) in &ns.methods {
            let dup_in_batch = ns.methods.iter().filter(|(n, _)| n == name).count() > 1;
            if dup_in_batch || self.methods.contains_key(name) {
                return Err(RegisterError::DuplicateMethod(name.clone()));
            }
        }

        self.namespaces.insert(namespace.to_string());
        for (name, handler) in ns.methods {
            self.methods.insert(name, handler);
        }
        Ok(())
    }

    /// Case-sensitive lookup.
    pub fn get(&self, method: &str) -> Option<&MethodHandler> {
        self.methods.get(method)
    }

    /// All registered method names.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Builder scope for the methods of one namespace.
pub struct Namespace<'a> {
    namespace: &'a str,
    methods: Vec<(String, MethodHandler)>,
}

impl Namespace<'_> {
    /// Register a unary method.
    ///
    /// The handler receives the call context and a typed tuple of positional
    /// parameters, and returns `Result<R, E>`: `Ok` fills the result slot,
    /// `Err` becomes an application error (code 1).
    pub fn method<P, R, E, F, Fut>(&mut self, name: &str, func: F) -> &mut Self
    where
        P: RpcParams,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let func = Arc::new(func);
        let erased: HandlerFn = Arc::new(move |cx, params| {
            let func = Arc::clone(&func);
            async move {
                let args = P::decode(&params).map_err(|e| CallError::Decode(e.to_string()))?;
                match func(cx, args).await {
                    Ok(value) => serde_json::to_value(value)
                        .map(CallOutput::Value)
                        .map_err(|e| CallError::App(e.to_string())),
                    Err(e) => Err(CallError::App(e.to_string())),
                }
            }
            .boxed()
        });
        self.push(name, P::ARITY, MethodKind::Unary, erased);
        self
    }

    /// Register a streaming method.
    ///
    /// On success the handler returns a stream; the transport allocates a
    /// channel id, replies with it, and forwards each item as an
    /// `xrpc.ch.val` notification followed by a final `xrpc.ch.close`.
    pub fn streaming<P, S, R, E, F, Fut>(&mut self, name: &str, func: F) -> &mut Self
    where
        P: RpcParams,
        S: Stream<Item = R> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
    {
        let func = Arc::new(func);
        let erased: HandlerFn = Arc::new(move |cx, params| {
            let func = Arc::clone(&func);
            async move {
                let args = P::decode(&params).map_err(|e| CallError::Decode(e.to_string()))?;
                match func(cx, args).await {
                    Ok(source) => {
                        // Erase the typed source into a value stream here so
                        // the channel multiplexer stays homogeneous.
                        let erased = source
                            .filter_map(|item| async move {
                                match serde_json::to_value(item) {
                                    Ok(value) => Some(value),
                                    Err(e) => {
                                        warn!(error = %e, "dropping unencodable stream item");
                                        None
                                    }
                                }
                            })
                            .boxed();
                        Ok(CallOutput::Stream(erased))
                    }
                    Err(e) => Err(CallError::App(e.to_string())),
                }
            }
            .boxed()
        });
        self.push(name, P::ARITY, MethodKind::Streaming, erased);
        self
    }

    fn push(&mut self, name: &str, n_params: usize, kind: MethodKind, func: HandlerFn) {
        self.methods.push((
            format!("{}.{}", self.namespace, name),
            MethodHandler {
                n_params,
                kind,
                func,
            },
        ));
    }
}

/// Positional parameters recovered into typed values at dispatch time.
///
/// Implemented for tuples of deserializable types up to arity six. Each
/// position decodes independently into its declared type.
pub trait RpcParams: Sized + Send + 'static {
    const ARITY: usize;

    fn decode(params: &[Param]) -> Result<Self, serde_json::Error>;
}

impl RpcParams for () {
    const ARITY: usize = 0;

    fn decode(_params: &[Param]) -> Result<Self, serde_json::Error> {
        Ok(())
    }
}

macro_rules! impl_rpc_params {
    ($arity:expr => $($ty:ident : $idx:tt),+) => {
        impl<$($ty: DeserializeOwned + Send + 'static),+> RpcParams for ($($ty,)+) {
            const ARITY: usize = $arity;

            fn decode(params: &[Param]) -> Result<Self, serde_json::Error> {
                if params.len() != Self::ARITY {
                    return Err(serde::de::Error::custom("wrong param count"));
                }
                Ok(($(params[$idx].decode::<$ty>()?,)+))
            }
        }
    };
}

impl_rpc_params!(1 => P0:0);
impl_rpc_params!(2 => P0:0, P1:1);
impl_rpc_params!(3 => P0:0, P1:1, P2:2);
impl_rpc_params!(4 => P0:0, P1:1, P2:2, P3:3);
impl_rpc_params!(5 => P0:0, P1:1, P2:2, P3:3, P4:4);
impl_rpc_params!(6 => P0:0, P1:1, P2:2, P3:3, P4:4, P5:5);
