//! The per-call client state machine.
//!
//! A [`ClientCall`] runs CREATED → STARTED → (HALF_CLOSED | CANCELLED) →
//! CLOSED. It owns the effective deadline (the smaller of the context's and
//! the options'), the deadline timer, and the serialized delivery of listener
//! callbacks: `on_headers` before the first `on_message`, messages in receive
//! order, and `on_close` last and exactly once. A panic in an application
//! callback cancels the call with CANCELLED carrying the panic as the cause,
//! overriding any status the server may have produced afterwards.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use braid_core::{encode_timeout, Context, Metadata, PanicError, Status};

use crate::executor::SerialExecutor;
use crate::transport::{ClientStream, ClientStreamListener, ClientTransport};
use braid_core::CallOptions;

/// The shape of a method's request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

/// Identifies one RPC method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    full_name: String,
    method_type: MethodType,
}

impl MethodDescriptor {
    pub fn new(full_name: impl Into<String>, method_type: MethodType) -> MethodDescriptor {
        MethodDescriptor {
            full_name: full_name.into(),
            method_type,
        }
    }

    /// `<service>/<method>`, the `:path` without its leading slash.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    pub fn generate_full_name(service: &str, method: &str) -> String {
        format!("{}/{}", service, method)
    }
}

/// Application-side callbacks for one call. Delivered in order on the call's
/// serializing executor, with the call's context attached.
pub trait ClientCallListener: Send + 'static {
    fn on_headers(&mut self, _headers: Metadata) {}
    fn on_message(&mut self, message: Bytes);
    fn on_ready(&mut self) {}
    fn on_close(&mut self, status: Status, trailers: Metadata);
}

/// Source of transports for new calls; implemented by the channel.
pub(crate) trait ClientTransportProvider: Send + Sync {
    fn get_transport(&self, options: &CallOptions) -> Arc<dyn ClientTransport>;
}

// Headers the runtime owns; application-supplied values are dropped and the
// canonical values re-added at start.
const RESERVED_HEADERS: [&str; 4] = [
    "user-agent",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-timeout",
];

struct CallState {
    started: bool,
    half_closed: bool,
    cancelled: bool,
    /// Set inside the executor once `on_close` ran.
    closed: bool,
    /// First cancellation wins and overrides any later transport status.
    cancel_status: Option<Status>,
    stream: Option<Arc<dyn ClientStream>>,
    deadline_timer: Option<JoinHandle<()>>,
}

struct CallShared {
    state: Mutex<CallState>,
    listener: Mutex<Option<Box<dyn ClientCallListener>>>,
    executor: Mutex<Option<SerialExecutor>>,
    context: Mutex<Option<Context>>,
}

impl CallShared {
    fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(executor) = self.executor.lock().as_ref() {
            executor.execute(job);
        }
    }

    fn context(&self) -> Context {
        self.context.lock().clone().unwrap_or_else(Context::root)
    }

    /// Schedules the final callback. The first scheduled close wins; a
    /// recorded cancellation status overrides `status`.
    fn schedule_close(self: &Arc<Self>, status: Status, trailers: Metadata) {
        let shared = self.clone();
        self.schedule(move || {
            let final_status = {
                let mut state = shared.state.lock();
                if state.closed {
                    return;
                }
                state.closed = true;
                if let Some(timer) = state.deadline_timer.take() {
                    timer.abort();
                }
                state.cancel_status.clone().unwrap_or(status)
            };
            let context = shared.context();
            let _attached = context.attach();
            let listener = shared.listener.lock().take();
            if let Some(mut listener) = listener {
                if catch_unwind(AssertUnwindSafe(|| listener.on_close(final_status, trailers)))
                    .is_err()
                {
                    tracing::error!("listener panicked in on_close");
                }
            }
        });
    }

    /// The cancellation path shared by user cancel, deadline expiry and
    /// listener panics.
    fn cancel_with(self: &Arc<Self>, status: Status) {
        let stream = {
            let mut state = self.state.lock();
            if state.cancelled || state.closed {
                return;
            }
            state.cancelled = true;
            state.cancel_status = Some(status.clone());
            state.stream.clone()
        };
        match stream {
            // The transport reports the close; cancel_status overrides its
            // status on delivery.
            Some(stream) => stream.cancel(status),
            None => self.schedule_close(status, Metadata::new()),
        }
    }

    fn cancel_from_panic(self: &Arc<Self>, payload: Box<dyn std::any::Any + Send>) {
        let recovered = Status::from_panic(payload.as_ref());
        let message = recovered
            .description()
            .unwrap_or("application listener panicked")
            .to_string();
        let status = Status::cancelled("application listener panicked")
            .with_cause(Arc::new(PanicError(message)));
        self.cancel_with(status);
    }
}

/// One client call. Created by the channel; does nothing until
/// [`start`](ClientCall::start).
pub struct ClientCall {
    method: MethodDescriptor,
    options: CallOptions,
    provider: Arc<dyn ClientTransportProvider>,
    default_executor: tokio::runtime::Handle,
    shared: Arc<CallShared>,
}

impl ClientCall {
    pub(crate) fn new(
        method: MethodDescriptor,
        options: CallOptions,
        provider: Arc<dyn ClientTransportProvider>,
        default_executor: tokio::runtime::Handle,
    ) -> ClientCall {
        ClientCall {
            method,
            options,
            provider,
            default_executor,
            shared: Arc::new(CallShared {
                state: Mutex::new(CallState {
                    started: false,
                    half_closed: false,
                    cancelled: false,
                    closed: false,
                    cancel_status: None,
                    stream: None,
                    deadline_timer: None,
                }),
                listener: Mutex::new(None),
                executor: Mutex::new(None),
                context: Mutex::new(None),
            }),
        }
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Starts the call.
    ///
    /// Captures the caller's [`Context`], computes the effective deadline,
    /// scrubs reserved headers, acquires a transport and opens the wire
    /// stream. If the effective deadline has already expired the call closes
    /// with DEADLINE_EXCEEDED without touching any transport.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn start(&self, listener: impl ClientCallListener, mut headers: Metadata) {
        {
            let mut state = self.shared.state.lock();
            assert!(!state.started, "start called twice");
            state.started = true;
        }
        let context = Context::current();
        let executor_handle = self
            .options
            .executor()
            .cloned()
            .unwrap_or_else(|| self.default_executor.clone());
        let executor = SerialExecutor::new(&executor_handle);
        *self.shared.listener.lock() = Some(Box::new(listener));
        *self.shared.executor.lock() = Some(executor.clone());
        *self.shared.context.lock() = Some(context.clone());

        // A cancel that raced in before start wins immediately.
        if let Some(status) = {
            let state = self.shared.state.lock();
            state.cancel_status.clone()
        } {
            self.shared.schedule_close(status, Metadata::new());
            return;
        }
        if let Some(cause) = context.cancellation_cause() {
            self.shared.schedule_close(
                Status::cancelled("context was cancelled before the call started")
                    .with_cause(Arc::new(cause)),
                Metadata::new(),
            );
            return;
        }

        let deadline = match (self.options.deadline(), context.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(deadline) = deadline {
            if deadline.is_expired() {
                self.shared.schedule_close(
                    Status::deadline_exceeded("call started after deadline was exceeded"),
                    Metadata::new(),
                );
                return;
            }
        }

        for reserved in RESERVED_HEADERS {
            headers.remove_all(reserved);
        }
        if let Some(compressor) = self.options.compressor() {
            headers.put("grpc-encoding", compressor);
        }
        headers.put("grpc-accept-encoding", "identity");
        if let Some(deadline) = deadline {
            headers.put("grpc-timeout", encode_timeout(deadline.time_remaining()));
            let shared = self.shared.clone();
            let remaining = deadline.time_remaining();
            let timer = executor_handle.spawn(async move {
                tokio::time::sleep_until(deadline.expiration()).await;
                shared.cancel_with(Status::deadline_exceeded(format!(
                    "deadline exceeded after {:?}",
                    remaining
                )));
            });
            self.shared.state.lock().deadline_timer = Some(timer);
        }

        let transport = self.provider.get_transport(&self.options);
        let adapter = StreamAdapter {
            shared: self.shared.clone(),
            executor,
            context,
        };
        let stream = transport.new_stream(self.method.full_name(), headers, Box::new(adapter));

        // Publish the stream; if a cancel won the race, forward it now.
        let pending_cancel = {
            let mut state = self.shared.state.lock();
            state.stream = Some(stream.clone());
            if state.cancelled {
                state.cancel_status.clone()
            } else {
                None
            }
        };
        if let Some(status) = pending_cancel {
            stream.cancel(status);
        }
    }

    /// Sends one message. Fails after `half_close` or `cancel`.
    pub fn send_message(&self, message: Bytes) -> Result<(), Status> {
        let stream = {
            let state = self.shared.state.lock();
            if !state.started {
                return Err(Status::internal("call has not been started"));
            }
            if state.half_closed {
                return Err(Status::internal("call was half-closed"));
            }
            if state.cancelled || state.closed {
                return Err(Status::internal("call was cancelled"));
            }
            match &state.stream {
                Some(stream) => stream.clone(),
                None => return Err(Status::internal("call is already closed")),
            }
        };
        stream.send_message(message);
        Ok(())
    }

    /// Permits `count` further inbound messages.
    pub fn request(&self, count: u32) {
        let stream = self.shared.state.lock().stream.clone();
        if let Some(stream) = stream {
            stream.request(count);
        }
    }

    /// Signals that no further messages will be sent. Idempotent.
    pub fn half_close(&self) {
        let stream = {
            let mut state = self.shared.state.lock();
            if state.half_closed || state.cancelled || state.closed {
                return;
            }
            state.half_closed = true;
            state.stream.clone()
        };
        if let Some(stream) = stream {
            stream.half_close();
        }
    }

    /// Cancels the call. The first cancellation wins; the listener observes
    /// CANCELLED with `description` and `cause`.
    pub fn cancel(
        &self,
        description: &str,
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    ) {
        let mut status = Status::cancelled(description);
        if let Some(cause) = cause {
            status = status.with_cause(cause);
        }
        self.shared.cancel_with(status);
    }

    /// True once a cancellation has been recorded.
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }
}

/// Bridges transport callbacks onto the call's serializing executor.
struct StreamAdapter {
    shared: Arc<CallShared>,
    executor: SerialExecutor,
    context: Context,
}

impl StreamAdapter {
    fn run_guarded(
        &self,
        callback: impl FnOnce(&mut dyn ClientCallListener) + Send + 'static,
    ) {
        let shared = self.shared.clone();
        let context = self.context.clone();
        self.executor.execute(move || {
            {
                let state = shared.state.lock();
                if state.closed || state.cancelled {
                    return;
                }
            }
            let _attached = context.attach();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if let Some(listener) = shared.listener.lock().as_mut() {
                    callback(listener.as_mut());
                }
            }));
            if let Err(payload) = outcome {
                shared.cancel_from_panic(payload);
            }
        });
    }
}

impl ClientStreamListener for StreamAdapter {
    fn on_headers(&mut self, headers: Metadata) {
        self.run_guarded(move |listener| listener.on_headers(headers));
    }

    fn on_message(&mut self, message: Bytes) {
        self.run_guarded(move |listener| listener.on_message(message));
    }

    fn on_ready(&mut self) {
        self.run_guarded(|listener| listener.on_ready());
    }

    fn on_close(&mut self, status: Status, trailers: Metadata) {
        self.shared.schedule_close(status, trailers);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::PingCallback;
    use braid_core::{Code, Deadline};

    struct ChannelListener {
        events: mpsc::UnboundedSender<String>,
        panic_on_message: bool,
    }

    impl ClientCallListener for ChannelListener {
        fn on_headers(&mut self, _headers: Metadata) {
            let _ = self.events.send("headers".into());
        }

        fn on_message(&mut self, message: Bytes) {
            let _ = self
                .events
                .send(format!("message({})", String::from_utf8_lossy(&message)));
            if self.panic_on_message {
                panic!("listener blew up");
            }
        }

        fn on_close(&mut self, status: Status, _trailers: Metadata) {
            let cause = status
                .cause()
                .map(|c| format!(" cause={}", c))
                .unwrap_or_default();
            let _ = self.events.send(format!(
                "close:{}:{}{}",
                status.code(),
                status.description().unwrap_or(""),
                cause
            ));
        }
    }

    /// A transport whose stream callbacks the test drives by hand.
    struct ManualTransport {
        listeners: Arc<Mutex<Vec<Box<dyn ClientStreamListener>>>>,
        streams_created: Arc<Mutex<usize>>,
        cancels: Arc<Mutex<Vec<Code>>>,
    }

    impl ManualTransport {
        fn new() -> ManualTransport {
            ManualTransport {
                listeners: Arc::new(Mutex::new(Vec::new())),
                streams_created: Arc::new(Mutex::new(0)),
                cancels: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct ManualStream {
        listeners: Arc<Mutex<Vec<Box<dyn ClientStreamListener>>>>,
        cancels: Arc<Mutex<Vec<Code>>>,
        index: usize,
    }

    impl ClientStream for ManualStream {
        fn send_message(&self, _message: Bytes) {}
        fn half_close(&self) {}

        fn cancel(&self, status: Status) {
            self.cancels.lock().push(status.code());
            // The transport reports the cancellation back, as the real
            // handler does.
            let mut listeners = self.listeners.lock();
            listeners[self.index].on_close(status, Metadata::new());
        }

        fn request(&self, _count: u32) {}
    }

    impl ClientTransport for ManualTransport {
        fn new_stream(
            &self,
            _method: &str,
            _headers: Metadata,
            listener: Box<dyn ClientStreamListener>,
        ) -> Arc<dyn ClientStream> {
            *self.streams_created.lock() += 1;
            let mut listeners = self.listeners.lock();
            listeners.push(listener);
            Arc::new(ManualStream {
                listeners: self.listeners.clone(),
                cancels: self.cancels.clone(),
                index: listeners.len() - 1,
            })
        }

        fn ping(&self, callback: PingCallback) {
            callback(Ok(Duration::from_micros(1)));
        }
    }

    struct FixedProvider {
        transport: Arc<ManualTransport>,
    }

    impl ClientTransportProvider for FixedProvider {
        fn get_transport(&self, _options: &CallOptions) -> Arc<dyn ClientTransport> {
            self.transport.clone()
        }
    }

    fn new_call(
        transport: Arc<ManualTransport>,
        options: CallOptions,
    ) -> ClientCall {
        ClientCall::new(
            MethodDescriptor::new("test.Svc/Run", MethodType::Unary),
            options,
            Arc::new(FixedProvider { transport }),
            tokio::runtime::Handle::current(),
        )
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("sender alive")
    }

    #[tokio::test]
    async fn expired_deadline_closes_without_touching_the_transport() {
        let transport = Arc::new(ManualTransport::new());
        let call = new_call(
            transport.clone(),
            CallOptions::new().with_deadline(Deadline::after(Duration::ZERO)),
        );
        let (tx, mut events) = mpsc::unbounded_channel();
        call.start(
            ChannelListener {
                events: tx,
                panic_on_message: false,
            },
            Metadata::new(),
        );
        let event = next(&mut events).await;
        assert!(event.starts_with("close:DEADLINE_EXCEEDED"), "{}", event);
        assert_eq!(*transport.streams_created.lock(), 0, "no stream opened");
    }

    #[tokio::test]
    async fn callbacks_arrive_in_order_and_close_is_final() {
        let transport = Arc::new(ManualTransport::new());
        let call = new_call(transport.clone(), CallOptions::new());
        let (tx, mut events) = mpsc::unbounded_channel();
        call.start(
            ChannelListener {
                events: tx,
                panic_on_message: false,
            },
            Metadata::new(),
        );
        call.request(2);
        {
            let mut listeners = transport.listeners.lock();
            let listener = &mut listeners[0];
            listener.on_headers(Metadata::new());
            listener.on_message(Bytes::from_static(b"a"));
            listener.on_message(Bytes::from_static(b"b"));
            listener.on_close(Status::ok(), Metadata::new());
            // Anything after close is suppressed.
            listener.on_message(Bytes::from_static(b"late"));
        }
        assert_eq!(next(&mut events).await, "headers");
        assert_eq!(next(&mut events).await, "message(a)");
        assert_eq!(next(&mut events).await, "message(b)");
        assert!(next(&mut events).await.starts_with("close:OK"));
        assert!(events.try_recv().is_err(), "no callback after close");
    }

    #[tokio::test]
    async fn listener_panic_cancels_and_overrides_a_later_ok() {
        let transport = Arc::new(ManualTransport::new());
        let call = new_call(transport.clone(), CallOptions::new());
        let (tx, mut events) = mpsc::unbounded_channel();
        call.start(
            ChannelListener {
                events: tx,
                panic_on_message: true,
            },
            Metadata::new(),
        );
        {
            let mut listeners = transport.listeners.lock();
            listeners[0].on_message(Bytes::from_static(b"boom"));
        }
        assert_eq!(next(&mut events).await, "message(boom)");
        let close = next(&mut events).await;
        assert!(close.starts_with("close:CANCELLED"), "{}", close);
        assert!(close.contains("listener blew up"), "{}", close);
        assert_eq!(transport.cancels.lock().as_slice(), &[Code::Cancelled]);

        // A server OK trailer arriving later does not override.
        {
            let mut listeners = transport.listeners.lock();
            listeners[0].on_close(Status::ok(), Metadata::new());
        }
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_message_after_half_close_is_rejected() {
        let transport = Arc::new(ManualTransport::new());
        let call = new_call(transport.clone(), CallOptions::new());
        let (tx, _events) = mpsc::unbounded_channel();
        call.start(
            ChannelListener {
                events: tx,
                panic_on_message: false,
            },
            Metadata::new(),
        );
        assert!(call.send_message(Bytes::from_static(b"ok")).is_ok());
        call.half_close();
        let err = call.send_message(Bytes::from_static(b"no")).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        call.half_close(); // idempotent
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_timer_cancels_the_stream() {
        let transport = Arc::new(ManualTransport::new());
        let call = new_call(
            transport.clone(),
            CallOptions::new().with_deadline_after(Duration::from_millis(50)),
        );
        let (tx, mut events) = mpsc::unbounded_channel();
        call.start(
            ChannelListener {
                events: tx,
                panic_on_message: false,
            },
            Metadata::new(),
        );
        assert_eq!(*transport.streams_created.lock(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let close = next(&mut events).await;
        assert!(close.starts_with("close:DEADLINE_EXCEEDED"), "{}", close);
        assert_eq!(transport.cancels.lock().as_slice(), &[Code::DeadlineExceeded]);
    }
}
