//! Whole-stack exercises: managed channel → balancer → transport set →
//! client handler → in-memory wire → server handler → managed server →
//! method registry, and back.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use braid::{
    CallOptions, ClientCallListener, Code, HandlerRegistry, InProcessServer,
    InProcessTransportFactory, ManagedChannel, ManagedServer, Metadata, MethodDescriptor,
    MethodType, ServerCall, ServerCallHandler, ServerCallListener, StaticResolverFactory, Status,
};

struct CallEvents {
    tx: mpsc::UnboundedSender<String>,
}

impl ClientCallListener for CallEvents {
    fn on_headers(&mut self, headers: Metadata) {
        let tenant = headers.get("x-tenant").unwrap_or("-");
        let _ = self.tx.send(format!("headers[x-tenant={}]", tenant));
    }

    fn on_message(&mut self, message: Bytes) {
        let _ = self
            .tx
            .send(format!("message({})", String::from_utf8_lossy(&message)));
    }

    fn on_close(&mut self, status: Status, _trailers: Metadata) {
        let _ = self.tx.send(format!(
            "close:{}:{}",
            status.code(),
            status.description().unwrap_or("")
        ));
    }
}

/// Echoes every request message back, copying `x-tenant` into the response
/// headers.
struct EchoHandler;

struct EchoListener {
    call: Arc<ServerCall>,
    tenant: Option<String>,
    received: Vec<Bytes>,
}

impl ServerCallHandler for EchoHandler {
    fn start_call(&self, call: Arc<ServerCall>, headers: &Metadata) -> Box<dyn ServerCallListener> {
        call.request(16);
        Box::new(EchoListener {
            call,
            tenant: headers.get("x-tenant").map(String::from),
            received: Vec::new(),
        })
    }
}

impl ServerCallListener for EchoListener {
    fn on_message(&mut self, message: Bytes) {
        self.received.push(message);
    }

    fn on_half_close(&mut self) {
        let mut headers = Metadata::new();
        if let Some(tenant) = &self.tenant {
            headers.put("x-tenant", tenant.clone());
        }
        self.call.send_headers(headers).expect("headers");
        for message in self.received.drain(..) {
            self.call.send_message(message).expect("message");
        }
        self.call.close(Status::ok(), Metadata::new()).expect("close");
    }
}

/// Accepts the call and never answers; only a deadline ends it.
struct BlackHoleHandler;

struct BlackHoleListener;

impl ServerCallHandler for BlackHoleHandler {
    fn start_call(&self, call: Arc<ServerCall>, _headers: &Metadata) -> Box<dyn ServerCallListener> {
        call.request(1);
        Box::new(BlackHoleListener)
    }
}

impl ServerCallListener for BlackHoleListener {
    fn on_message(&mut self, _message: Bytes) {}
    fn on_half_close(&mut self) {}
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn stack(registry: Arc<HandlerRegistry>) -> (ManagedServer, ManagedChannel) {
    init_tracing();
    let listener = Arc::new(InProcessServer::new());
    let server = ManagedServer::builder(listener.clone())
        .registry(registry)
        .build();
    server.start().expect("server starts");
    let channel = ManagedChannel::builder("static:///echo.test")
        .name_resolver_factory(Arc::new(StaticResolverFactory::new(vec![
            "127.0.0.1:50051".parse().unwrap()
        ])))
        .transport_factory(Arc::new(InProcessTransportFactory::new(listener)))
        .user_agent("e2e-test/1.0")
        .build()
        .expect("channel builds");
    (server, channel)
}

async fn next(events: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("sender alive")
}

#[tokio::test]
async fn unary_echo_round_trip() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.add_method("echo.Echo/Ping", Arc::new(EchoHandler));
    let (server, channel) = stack(registry);

    let call = channel.new_call(
        MethodDescriptor::new("echo.Echo/Ping", MethodType::Unary),
        CallOptions::new(),
    );
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut headers = Metadata::new();
    headers.put("x-tenant", "blue");
    call.start(CallEvents { tx }, headers);
    call.request(2);
    call.send_message(Bytes::from_static(b"hello")).expect("send");
    call.half_close();

    assert_eq!(next(&mut events).await, "headers[x-tenant=blue]");
    assert_eq!(next(&mut events).await, "message(hello)");
    assert_eq!(next(&mut events).await, "close:OK:");

    channel.shutdown();
    assert!(channel.await_termination(Duration::from_secs(5)).await);
    assert!(channel.is_terminated() && channel.is_shutdown());
    server.shutdown();
    assert!(server.await_termination(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn streaming_echo_preserves_message_order() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.add_method("echo.Echo/Stream", Arc::new(EchoHandler));
    let (_server, channel) = stack(registry);

    let call = channel.new_call(
        MethodDescriptor::new("echo.Echo/Stream", MethodType::BidiStreaming),
        CallOptions::new(),
    );
    let (tx, mut events) = mpsc::unbounded_channel();
    call.start(CallEvents { tx }, Metadata::new());
    call.request(8);
    for message in ["one", "two", "three", "four"] {
        call.send_message(Bytes::from(message.as_bytes().to_vec()))
            .expect("send");
    }
    call.half_close();

    assert!(next(&mut events).await.starts_with("headers"));
    for expected in ["one", "two", "three", "four"] {
        assert_eq!(next(&mut events).await, format!("message({})", expected));
    }
    assert_eq!(next(&mut events).await, "close:OK:");
}

#[tokio::test]
async fn unimplemented_method_surfaces_on_the_client() {
    let (_server, channel) = stack(Arc::new(HandlerRegistry::new()));

    let call = channel.new_call(
        MethodDescriptor::new("echo.Echo/Missing", MethodType::Unary),
        CallOptions::new(),
    );
    let (tx, mut events) = mpsc::unbounded_channel();
    call.start(CallEvents { tx }, Metadata::new());
    call.half_close();

    let close = next(&mut events).await;
    assert!(
        close.starts_with(&format!("close:{}:Method not found", Code::Unimplemented)),
        "{}",
        close
    );
}

#[tokio::test(start_paused = true)]
async fn deadline_propagates_and_cancels_both_sides() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.add_method("echo.Echo/Hang", Arc::new(BlackHoleHandler));
    let (_server, channel) = stack(registry);

    let call = channel.new_call(
        MethodDescriptor::new("echo.Echo/Hang", MethodType::Unary),
        CallOptions::new().with_deadline_after(Duration::from_millis(80)),
    );
    let (tx, mut events) = mpsc::unbounded_channel();
    call.start(CallEvents { tx }, Metadata::new());
    call.send_message(Bytes::from_static(b"anyone there")).expect("send");
    call.half_close();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let close = next(&mut events).await;
    assert!(
        close.starts_with(&format!("close:{}", Code::DeadlineExceeded)),
        "{}",
        close
    );
}

#[tokio::test]
async fn calls_after_shutdown_fail_unavailable() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.add_method("echo.Echo/Ping", Arc::new(EchoHandler));
    let (_server, channel) = stack(registry);
    channel.shutdown();

    let call = channel.new_call(
        MethodDescriptor::new("echo.Echo/Ping", MethodType::Unary),
        CallOptions::new(),
    );
    let (tx, mut events) = mpsc::unbounded_channel();
    call.start(CallEvents { tx }, Metadata::new());
    let close = next(&mut events).await;
    assert_eq!(
        close,
        format!("close:{}:Channel is shutdown", Code::Unavailable)
    );
}
