//! The managed server: listener lifecycle, method dispatch and per-call
//! execution contexts.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use braid_core::{decode_timeout, CancellableContext, Code, Context, Deadline, Metadata, Status};

use crate::executor::{shared_callback_executor, SerialExecutor};
use crate::transport::{
    InternalServer, ServerListener, ServerStream, ServerStreamListener, ServerTransport,
    ServerTransportListener,
};

/// Application callbacks for one inbound call, delivered in order on the
/// call's serializing executor.
pub trait ServerCallListener: Send + 'static {
    fn on_message(&mut self, message: Bytes);
    /// The client finished sending.
    fn on_half_close(&mut self);
    /// The call ended without a completed response.
    fn on_cancel(&mut self) {}
    /// The response (trailers included) went out.
    fn on_complete(&mut self) {}
    fn on_ready(&mut self) {}
}

/// Produces the listener for one call. The registry maps fully-qualified
/// method names to handlers.
pub trait ServerCallHandler: Send + Sync {
    fn start_call(&self, call: Arc<ServerCall>, headers: &Metadata) -> Box<dyn ServerCallListener>;
}

/// A mutable method-name → handler registry.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: Mutex<HashMap<String, Arc<dyn ServerCallHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers `handler` for a fully-qualified `<service>/<method>` name,
    /// replacing any previous registration.
    pub fn add_method(&self, full_name: impl Into<String>, handler: Arc<dyn ServerCallHandler>) {
        self.methods.lock().insert(full_name.into(), handler);
    }

    pub fn lookup(&self, full_name: &str) -> Option<Arc<dyn ServerCallHandler>> {
        self.methods.lock().get(full_name).cloned()
    }
}

struct ServerCallState {
    headers_sent: bool,
    closed: bool,
}

/// The server side of one call.
pub struct ServerCall {
    stream: Arc<dyn ServerStream>,
    method: String,
    context: Context,
    cancelled: Arc<AtomicBool>,
    state: Mutex<ServerCallState>,
}

impl ServerCall {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The call's context: cancelled on client cancellation or deadline
    /// expiry, carrying the deadline derived from `grpc-timeout`.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Permits `count` further inbound messages.
    pub fn request(&self, count: u32) {
        self.stream.request(count);
    }

    /// Sends the response headers. At most once, before `close`.
    pub fn send_headers(&self, headers: Metadata) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Status::internal("call is closed"));
        }
        if state.headers_sent {
            return Err(Status::internal("headers were already sent"));
        }
        state.headers_sent = true;
        drop(state);
        self.stream.send_headers(headers);
        Ok(())
    }

    /// Sends one response message; headers must have been sent.
    pub fn send_message(&self, message: Bytes) -> Result<(), Status> {
        let state = self.state.lock();
        if state.closed {
            return Err(Status::internal("call is closed"));
        }
        if !state.headers_sent {
            return Err(Status::internal("send_headers must be called first"));
        }
        drop(state);
        self.stream.send_message(message);
        Ok(())
    }

    /// Ends the call with `status` in the trailers. At most once.
    pub fn close(&self, status: Status, trailers: Metadata) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Status::internal("call is already closed"));
        }
        state.closed = true;
        drop(state);
        self.stream.close(status, trailers);
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.context.is_cancelled()
    }
}

struct ServerState {
    started: bool,
    shutdown: bool,
    terminated: bool,
    shutdown_now_status: Option<Status>,
    server_shutdown_invoked: bool,
    transport_server_terminated: bool,
    transports: Vec<Arc<dyn ServerTransport>>,
}

struct ServerInner {
    self_weak: Weak<ServerInner>,
    transport_server: Arc<dyn InternalServer>,
    registry: Arc<HandlerRegistry>,
    fallback: Option<Arc<HandlerRegistry>>,
    root_context: Context,
    executor: tokio::runtime::Handle,
    terminated_notify: Notify,
    lock: Mutex<ServerState>,
}

impl ServerInner {
    fn transport_closed(&self, transport: &dyn ServerTransport) {
        let became_terminated = {
            let mut state = self.lock.lock();
            state
                .transports
                .retain(|t| !std::ptr::eq(t.as_ref() as *const _ as *const u8, transport as *const _ as *const u8));
            self.check_for_termination(&mut state)
        };
        if became_terminated {
            self.finish_termination();
        }
    }

    fn check_for_termination(&self, state: &mut ServerState) -> bool {
        if !state.terminated
            && state.shutdown
            && state.transports.is_empty()
            && state.transport_server_terminated
        {
            state.terminated = true;
            true
        } else {
            false
        }
    }

    fn finish_termination(&self) {
        tracing::debug!("server terminated");
        self.terminated_notify.notify_waiters();
        shared_callback_executor().release();
    }
}

/// Builds a [`ManagedServer`].
pub struct ManagedServerBuilder {
    transport_server: Arc<dyn InternalServer>,
    registry: Arc<HandlerRegistry>,
    fallback: Option<Arc<HandlerRegistry>>,
    root_context: Context,
}

impl ManagedServerBuilder {
    pub fn new(transport_server: Arc<dyn InternalServer>) -> ManagedServerBuilder {
        ManagedServerBuilder {
            transport_server,
            registry: Arc::new(HandlerRegistry::new()),
            fallback: None,
            root_context: Context::root(),
        }
    }

    /// The primary method registry.
    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> ManagedServerBuilder {
        self.registry = registry;
        self
    }

    /// Consulted when the primary registry misses.
    pub fn fallback_registry(mut self, registry: Arc<HandlerRegistry>) -> ManagedServerBuilder {
        self.fallback = Some(registry);
        self
    }

    /// Base context for per-call contexts. Values are inherited; the
    /// server's calls never inherit its cancellation.
    pub fn root_context(mut self, context: Context) -> ManagedServerBuilder {
        self.root_context = context;
        self
    }

    pub fn build(self) -> ManagedServer {
        let executor = shared_callback_executor().get();
        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| ServerInner {
            self_weak: weak.clone(),
            transport_server: self.transport_server,
            registry: self.registry,
            fallback: self.fallback,
            // Fork so cancellation of the given context never tears down
            // running calls; only values flow through.
            root_context: self.root_context.fork(),
            executor,
            terminated_notify: Notify::new(),
            lock: Mutex::new(ServerState {
                started: false,
                shutdown: false,
                terminated: false,
                shutdown_now_status: None,
                server_shutdown_invoked: false,
                transport_server_terminated: false,
                transports: Vec::new(),
            }),
        });
        ManagedServer { inner }
    }
}

/// The server handle.
#[derive(Clone)]
pub struct ManagedServer {
    inner: Arc<ServerInner>,
}

impl ManagedServer {
    pub fn builder(transport_server: Arc<dyn InternalServer>) -> ManagedServerBuilder {
        ManagedServerBuilder::new(transport_server)
    }

    /// Binds the listener and starts accepting. Exactly once.
    pub fn start(&self) -> Result<(), Status> {
        {
            let mut state = self.inner.lock.lock();
            if state.started {
                return Err(Status::new(Code::FailedPrecondition)
                    .with_description("server is already started"));
            }
            if state.shutdown {
                return Err(Status::new(Code::FailedPrecondition)
                    .with_description("server is shutting down"));
            }
            state.started = true;
        }
        self.inner.transport_server.start(Box::new(ServerListenerImpl {
            inner: self.inner.self_weak.clone(),
        }))
    }

    /// Stops accepting connections; existing streams continue.
    pub fn shutdown(&self) {
        let shutdown_listener = {
            let mut state = self.inner.lock.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            if state.started {
                true
            } else {
                state.transport_server_terminated = true;
                let became = self.inner.check_for_termination(&mut state);
                drop(state);
                if became {
                    self.inner.finish_termination();
                }
                false
            }
        };
        if shutdown_listener {
            self.inner.transport_server.shutdown();
        }
    }

    /// Shuts down and additionally hard-closes every live transport.
    pub fn shutdown_now(&self, status: Status) {
        self.shutdown();
        let transports = {
            let mut state = self.inner.lock.lock();
            if state.shutdown_now_status.is_some() {
                return;
            }
            state.shutdown_now_status = Some(status.clone());
            if state.server_shutdown_invoked {
                state.transports.clone()
            } else {
                // server_shutdown will pick the status up when it runs.
                Vec::new()
            }
        };
        for transport in transports {
            transport.shutdown_now(status.clone());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock.lock().shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock.lock().terminated
    }

    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.terminated_notify.notified();
            if self.inner.lock.lock().terminated {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.lock.lock().terminated;
            }
        }
    }
}

struct ServerListenerImpl {
    inner: Weak<ServerInner>,
}

impl ServerListener for ServerListenerImpl {
    fn transport_created(
        &mut self,
        transport: Arc<dyn ServerTransport>,
    ) -> Box<dyn ServerTransportListener> {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock.lock().transports.push(transport.clone());
        }
        Box::new(ServerTransportListenerImpl {
            inner: self.inner.clone(),
            transport,
        })
    }

    fn server_shutdown(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let (transports, now_status) = {
            let mut state = inner.lock.lock();
            state.server_shutdown_invoked = true;
            (state.transports.clone(), state.shutdown_now_status.clone())
        };
        for transport in transports {
            match &now_status {
                Some(status) => transport.shutdown_now(status.clone()),
                None => transport.shutdown(),
            }
        }
        let became = {
            let mut state = inner.lock.lock();
            state.transport_server_terminated = true;
            inner.check_for_termination(&mut state)
        };
        if became {
            inner.finish_termination();
        }
    }
}

struct ServerTransportListenerImpl {
    inner: Weak<ServerInner>,
    transport: Arc<dyn ServerTransport>,
}

impl ServerTransportListener for ServerTransportListenerImpl {
    fn stream_created(&mut self, stream: Arc<dyn ServerStream>, method: String, headers: Metadata) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let timeout = headers
            .get("grpc-timeout")
            .and_then(|value| decode_timeout(value).ok());
        let context = match timeout {
            Some(timeout) => inner
                .root_context
                .with_deadline(Deadline::after(timeout), &inner.executor),
            None => inner.root_context.with_cancellation(),
        };
        // A deadline that fires before the client cancels tears the stream
        // down from our side.
        let cancel_stream = stream.clone();
        context.add_listener(move |status| {
            if status.code() == Code::DeadlineExceeded {
                cancel_stream.cancel(status.clone());
            }
        });

        let executor = SerialExecutor::new(&inner.executor);
        let cancellable = Arc::new(context);
        let jump = JumpToApplicationListener {
            executor: executor.clone(),
            context: cancellable.context(),
            cancellable: cancellable.clone(),
            stream: stream.clone(),
            listener: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let slot = jump.listener.clone();
        let cancelled_flag = jump.cancelled.clone();
        stream.set_listener(Box::new(jump));

        // Resolve the method on the call executor so the listener slot is
        // populated before any queued callback runs.
        let registry = inner.registry.clone();
        let fallback = inner.fallback.clone();
        let dispatch_context = cancellable.context();
        executor.execute(move || {
            let _attached = dispatch_context.attach();
            let handler = registry
                .lookup(&method)
                .or_else(|| fallback.as_ref().and_then(|f| f.lookup(&method)));
            let Some(handler) = handler else {
                tracing::debug!(%method, "method not found");
                stream.close(
                    Status::unimplemented(format!("Method not found: {}", method)),
                    Metadata::new(),
                );
                cancellable.cancel(Status::cancelled("method not found"));
                return;
            };
            let call = Arc::new(ServerCall {
                stream: stream.clone(),
                method: method.clone(),
                context: dispatch_context.clone(),
                cancelled: cancelled_flag,
                state: Mutex::new(ServerCallState {
                    headers_sent: false,
                    closed: false,
                }),
            });
            match catch_unwind(AssertUnwindSafe(|| handler.start_call(call, &headers))) {
                Ok(listener) => {
                    *slot.lock() = Some(listener);
                }
                Err(payload) => {
                    let status = Status::from_panic(payload.as_ref());
                    tracing::warn!(%method, %status, "handler panicked in start_call");
                    stream.close(status.clone(), Metadata::new());
                    cancellable.cancel(status);
                }
            }
        });
    }

    fn transport_terminated(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.transport_closed(self.transport.as_ref());
        }
    }
}

/// Re-dispatches transport callbacks onto the call's serializing executor so
/// the application sees a linear sequence, with the call context attached and
/// panics converted into stream closure.
struct JumpToApplicationListener {
    executor: SerialExecutor,
    context: Context,
    cancellable: Arc<CancellableContext>,
    stream: Arc<dyn ServerStream>,
    listener: Arc<Mutex<Option<Box<dyn ServerCallListener>>>>,
    cancelled: Arc<AtomicBool>,
}

impl JumpToApplicationListener {
    fn run_guarded(&self, callback: impl FnOnce(&mut dyn ServerCallListener) + Send + 'static) {
        let slot = self.listener.clone();
        let context = self.context.clone();
        let stream = self.stream.clone();
        self.executor.execute(move || {
            let _attached = context.attach();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if let Some(listener) = slot.lock().as_mut() {
                    callback(listener.as_mut());
                }
            }));
            if let Err(payload) = outcome {
                let status = Status::from_panic(payload.as_ref());
                tracing::warn!(%status, "application listener panicked");
                stream.close(status, Metadata::new());
            }
        });
    }
}

impl ServerStreamListener for JumpToApplicationListener {
    fn on_message(&mut self, message: Bytes) {
        self.run_guarded(move |listener| listener.on_message(message));
    }

    fn half_closed(&mut self) {
        self.run_guarded(|listener| listener.on_half_close());
    }

    fn on_ready(&mut self) {
        self.run_guarded(|listener| listener.on_ready());
    }

    fn closed(&mut self, status: Status) {
        if !status.is_ok() {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        let slot = self.listener.clone();
        let context = self.context.clone();
        let cancellable = self.cancellable.clone();
        self.executor.execute(move || {
            let _attached = context.attach();
            let ok = status.is_ok();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if let Some(listener) = slot.lock().take().as_mut() {
                    if ok {
                        listener.on_complete();
                    } else {
                        listener.on_cancel();
                    }
                }
            }));
            if outcome.is_err() {
                tracing::warn!("application listener panicked during close");
            }
            // Whatever the outcome, listeners learn the call is over.
            cancellable.cancel(
                Status::cancelled("call completed").with_cause(Arc::new(status.clone())),
            );
        });
    }
}
