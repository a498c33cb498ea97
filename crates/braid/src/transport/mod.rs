//! Transport traits and the gRPC↔HTTP/2 header mapping.
//!
//! A transport owns one connection. Client streams and their listeners cross
//! the boundary as trait objects; every listener callback is invoked on the
//! connection's event-loop task, and anything that needs another executor
//! re-dispatches on its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use braid_core::http2::{HeaderBlock, HeaderField};
use braid_core::{Metadata, Status};

pub mod client;
pub mod mem;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

/// Content-Type for gRPC over HTTP/2.
pub const CONTENT_TYPE_GRPC: &str = "application/grpc";

/// The only request method gRPC uses.
pub const HTTP_METHOD_POST: &str = "POST";

/// Required `te` value; proxies that strip it are tolerated.
pub const TE_TRAILERS: &str = "trailers";

const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// True when a `content-type` denotes gRPC: `application/grpc` exactly, or
/// followed by `+` (subformat) or `;` (parameters).
pub fn is_grpc_content_type(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    match content_type.strip_prefix(CONTENT_TYPE_GRPC) {
        Some(rest) => rest.is_empty() || rest.starts_with('+') || rest.starts_with(';'),
        None => false,
    }
}

/// The `user-agent` sent on every stream: an optional application prefix, then
/// the canonical runtime token.
pub fn grpc_user_agent(application_user_agent: Option<&str>) -> String {
    match application_user_agent {
        Some(app) => format!("{} grpc-braid/{}", app, RUNTIME_VERSION),
        None => format!("grpc-braid/{}", RUNTIME_VERSION),
    }
}

/// Callbacks from a client transport for one stream.
///
/// `on_close` is delivered exactly once and is always the final callback.
pub trait ClientStreamListener: Send + 'static {
    fn on_headers(&mut self, headers: Metadata);
    fn on_message(&mut self, message: Bytes);
    fn on_ready(&mut self) {}
    fn on_close(&mut self, status: Status, trailers: Metadata);
}

/// Application-side handle to one outgoing stream. All operations are
/// non-blocking enqueues; failures surface through the listener.
pub trait ClientStream: Send + Sync {
    /// Sends one message payload (unframed; the stream frames it).
    fn send_message(&self, message: Bytes);
    /// Sends end-of-stream after any pending messages. Idempotent.
    fn half_close(&self);
    /// Resets the stream; the listener observes `status`.
    fn cancel(&self, status: Status);
    /// Permits `count` additional inbound messages.
    fn request(&self, count: u32);
}

/// Completion callback for a transport ping, with the round-trip time.
pub type PingCallback = Box<dyn FnOnce(Result<Duration, Status>) + Send>;

/// A connection that can host new calls.
pub trait ClientTransport: Send + Sync {
    /// Creates a stream for `method`. Never blocks; a broken transport
    /// reports failure through the listener.
    fn new_stream(
        &self,
        method: &str,
        headers: Metadata,
        listener: Box<dyn ClientStreamListener>,
    ) -> Arc<dyn ClientStream>;

    /// Measures connection liveness; at most one ping is in flight per
    /// connection, later callbacks piggyback on it.
    fn ping(&self, callback: PingCallback);
}

/// Lifecycle events from a managed transport, each delivered at most once
/// except `transport_in_use`, which fires on every 0↔≥1 active-stream edge.
pub trait TransportListener: Send + 'static {
    fn transport_ready(&mut self);
    fn transport_shutdown(&mut self, status: Status);
    fn transport_terminated(&mut self);
    fn transport_in_use(&mut self, in_use: bool);
}

/// A [`ClientTransport`] whose lifecycle the owner drives.
pub trait ManagedClientTransport: ClientTransport {
    /// Starts the connection's event loop. Called exactly once.
    fn start(&self, listener: Box<dyn TransportListener>);
    /// Stops accepting new streams, lets existing ones finish.
    fn shutdown(&self);
    /// Fails all streams with `status` and tears the connection down.
    fn shutdown_now(&self, status: Status);
}

/// Creates client transports for individual socket addresses.
pub trait ClientTransportFactory: Send + Sync {
    fn new_transport(
        &self,
        address: SocketAddr,
        authority: &str,
        user_agent: &str,
    ) -> Arc<dyn ManagedClientTransport>;

    /// Releases factory-wide resources; called when the last owner goes away.
    fn close(&self);
}

/// A transport that fails every stream with a fixed status.
pub struct FailingClientTransport {
    error: Status,
}

impl FailingClientTransport {
    pub fn new(error: Status) -> FailingClientTransport {
        FailingClientTransport { error }
    }
}

impl ClientTransport for FailingClientTransport {
    fn new_stream(
        &self,
        _method: &str,
        _headers: Metadata,
        mut listener: Box<dyn ClientStreamListener>,
    ) -> Arc<dyn ClientStream> {
        listener.on_close(self.error.clone(), Metadata::new());
        Arc::new(NoopClientStream)
    }

    fn ping(&self, callback: PingCallback) {
        callback(Err(self.error.clone()));
    }
}

/// The stream handed out after a failure has already been reported.
pub(crate) struct NoopClientStream;

impl ClientStream for NoopClientStream {
    fn send_message(&self, _message: Bytes) {}
    fn half_close(&self) {}
    fn cancel(&self, _status: Status) {}
    fn request(&self, _count: u32) {}
}

/// Callbacks from a server transport for one inbound stream.
pub trait ServerStreamListener: Send + 'static {
    fn on_message(&mut self, message: Bytes);
    /// The client sent end-of-stream; every message has been delivered.
    fn half_closed(&mut self);
    fn on_ready(&mut self) {}
    /// Final callback: OK after a completed response, non-OK on abort.
    fn closed(&mut self, status: Status);
}

/// Server-side handle to one inbound stream.
pub trait ServerStream: Send + Sync {
    /// Must be called synchronously from `stream_created`, before the
    /// transport processes any further event for the stream.
    fn set_listener(&self, listener: Box<dyn ServerStreamListener>);
    fn send_headers(&self, headers: Metadata);
    fn send_message(&self, message: Bytes);
    /// Sends trailers (or trailers-only) carrying `status` and ends the
    /// stream.
    fn close(&self, status: Status, trailers: Metadata);
    /// Resets the stream without a gRPC status on the wire.
    fn cancel(&self, status: Status);
    fn request(&self, count: u32);
}

/// One accepted connection on the server.
pub trait ServerTransport: Send + Sync {
    fn shutdown(&self);
    fn shutdown_now(&self, status: Status);
}

/// Callbacks from one server transport.
pub trait ServerTransportListener: Send + 'static {
    fn stream_created(&mut self, stream: Arc<dyn ServerStream>, method: String, headers: Metadata);
    fn transport_terminated(&mut self);
}

/// The listening side of a server: something like an accept loop.
pub trait InternalServer: Send + Sync {
    fn start(&self, listener: Box<dyn ServerListener>) -> Result<(), Status>;
    fn shutdown(&self);
}

/// Callbacks from an [`InternalServer`].
pub trait ServerListener: Send + 'static {
    fn transport_created(
        &mut self,
        transport: Arc<dyn ServerTransport>,
    ) -> Box<dyn ServerTransportListener>;
    fn server_shutdown(&mut self);
}

/// Builds the request header block for a new client stream. Call metadata
/// rides after the required headers, so a `grpc-timeout` entry placed there
/// by the call layer reaches the wire unchanged.
pub(crate) fn client_request_headers(
    method: &str,
    scheme: &str,
    authority: &str,
    user_agent: &str,
    metadata: &Metadata,
) -> HeaderBlock {
    let mut block = HeaderBlock::new();
    block.push(":method", HTTP_METHOD_POST);
    block.push(":scheme", scheme.to_string());
    block.push(":path", format!("/{}", method));
    block.push(":authority", authority.to_string());
    block.push("content-type", CONTENT_TYPE_GRPC);
    block.push("te", TE_TRAILERS);
    block.push("user-agent", user_agent.to_string());
    append_metadata(&mut block, metadata);
    block
}

/// Appends call metadata to a header block, base64-coding binary values.
pub(crate) fn append_metadata(block: &mut HeaderBlock, metadata: &Metadata) {
    let serialized = metadata.serialize();
    for pair in serialized.chunks_exact(2) {
        let name = String::from_utf8_lossy(&pair[0]).into_owned();
        block.push(name, pair[1].clone());
    }
}

/// Converts inbound headers to metadata. Pseudo-headers are dropped; entries
/// that fail validation are skipped with a warning rather than failing the
/// stream.
pub(crate) fn headers_to_metadata(block: &HeaderBlock) -> Metadata {
    let mut serialized = Vec::new();
    for HeaderField { name, value } in &block.fields {
        if name.starts_with(':') {
            continue;
        }
        serialized.push(name.as_bytes().to_vec());
        serialized.push(value.to_vec());
    }
    match Metadata::parse(&serialized) {
        Ok(metadata) => metadata,
        Err(error) => {
            tracing::warn!(%error, "dropping malformed inbound headers");
            let mut fallback = Vec::new();
            for pair in serialized.chunks_exact(2) {
                if Metadata::parse(pair).is_ok() {
                    fallback.extend_from_slice(pair);
                }
            }
            Metadata::parse(&fallback).unwrap_or_default()
        }
    }
}

/// Builds response trailers. With `first_block` the block also carries the
/// `:status`/`content-type` prefix (trailers-only responses).
pub(crate) fn response_trailers(
    status: &Status,
    trailers: &Metadata,
    first_block: bool,
) -> HeaderBlock {
    let mut block = HeaderBlock::new();
    if first_block {
        block.push(":status", "200");
        block.push("content-type", CONTENT_TYPE_GRPC);
    }
    let mut with_status = trailers.clone();
    with_status.remove_all(braid_core::GRPC_STATUS_HEADER);
    with_status.remove_all(braid_core::GRPC_MESSAGE_HEADER);
    status.to_trailers(&mut with_status);
    append_metadata(&mut block, &with_status);
    block
}

/// Builds the response header block for a server stream.
pub(crate) fn response_headers(metadata: &Metadata) -> HeaderBlock {
    let mut block = HeaderBlock::new();
    block.push(":status", "200");
    block.push("content-type", CONTENT_TYPE_GRPC);
    append_metadata(&mut block, metadata);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::encode_timeout;

    #[test]
    fn content_type_variants() {
        assert!(is_grpc_content_type("application/grpc"));
        assert!(is_grpc_content_type("application/grpc+proto"));
        assert!(is_grpc_content_type("application/grpc;charset=utf-8"));
        assert!(is_grpc_content_type("APPLICATION/GRPC"));
        assert!(!is_grpc_content_type("application/grpcweb"));
        assert!(!is_grpc_content_type("application/json"));
        assert!(!is_grpc_content_type(""));
    }

    #[test]
    fn user_agent_keeps_the_application_prefix() {
        let ua = grpc_user_agent(Some("myapp/2.1"));
        assert!(ua.starts_with("myapp/2.1 grpc-braid/"));
        assert!(grpc_user_agent(None).starts_with("grpc-braid/"));
    }

    #[test]
    fn request_headers_carry_the_required_fields_in_order() {
        let mut metadata = Metadata::new();
        metadata.put("grpc-timeout", encode_timeout(Duration::from_secs(2)));
        metadata.put("x-custom", "v");
        let block = client_request_headers(
            "pkg.Svc/Method",
            "http",
            "example.com",
            "grpc-braid/0.1.0",
            &metadata,
        );
        assert_eq!(block.get_str(":method"), Some(HTTP_METHOD_POST));
        assert_eq!(block.get_str(":path"), Some("/pkg.Svc/Method"));
        assert_eq!(block.get_str(":authority"), Some("example.com"));
        assert_eq!(block.get_str("te"), Some(TE_TRAILERS));
        assert_eq!(block.get_str("content-type"), Some(CONTENT_TYPE_GRPC));
        assert_eq!(block.get_str("grpc-timeout"), Some("2000000u"));
        assert_eq!(block.get_str("x-custom"), Some("v"));
        // Pseudo-headers come first.
        assert!(block.fields[..4].iter().all(|f| f.name.starts_with(':')));
    }

    #[test]
    fn inbound_headers_drop_pseudo_headers() {
        let mut block = HeaderBlock::new();
        block.push(":status", "200");
        block.push("content-type", CONTENT_TYPE_GRPC);
        block.push("x-meta", "yes");
        let metadata = headers_to_metadata(&block);
        assert_eq!(metadata.get("x-meta"), Some("yes"));
        assert!(!metadata.contains_key(":status"));
        assert_eq!(metadata.len(), 2);
    }

    #[test]
    fn trailers_only_block_carries_status_line() {
        let block = response_trailers(&Status::unimplemented("nope"), &Metadata::new(), true);
        assert_eq!(block.get_str(":status"), Some("200"));
        assert_eq!(block.get_str("grpc-status"), Some("12"));
        assert_eq!(block.get_str("grpc-message"), Some("nope"));
    }
}
