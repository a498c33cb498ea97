//! braid: a managed RPC runtime over HTTP/2.
//!
//! The runtime multiplexes logical calls over shared HTTP/2 connections and
//! keeps them alive through transport churn:
//!
//! - [`ManagedChannel`] owns name resolution, load balancing, the per-address
//!   transport pools, idle mode and shutdown on the client side.
//! - [`ClientCall`] is the per-call state machine: deadline, cancellation,
//!   inbound flow-control permits, and in-order listener delivery.
//! - The transport handlers in [`transport`] translate between call commands
//!   and HTTP/2 frames on one event-loop task per connection, over the codec
//!   boundary defined in `braid-core`.
//! - [`ManagedServer`] accepts connections, dispatches new streams through a
//!   method registry and owns each call's execution context.
//!
//! Messages are opaque byte payloads; serialization lives with the
//! application. Wiring two processes together in-memory looks like:
//!
//! ```ignore
//! let server_transports = Arc::new(InProcessServer::new());
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.add_method("echo.Echo/Ping", Arc::new(MyHandler));
//! let server = ManagedServer::builder(server_transports.clone())
//!     .registry(registry)
//!     .build();
//! server.start()?;
//!
//! let channel = ManagedChannel::builder("static:///echo")
//!     .name_resolver_factory(Arc::new(StaticResolverFactory::new(addrs)))
//!     .transport_factory(Arc::new(InProcessTransportFactory::new(server_transports)))
//!     .build()?;
//! let call = channel.new_call(MethodDescriptor::new("echo.Echo/Ping", MethodType::Unary), CallOptions::new());
//! call.start(listener, Metadata::new());
//! ```

pub mod backoff;
pub mod balancer;
pub mod call;
pub mod channel;
pub mod delayed;
pub mod executor;
pub mod server;
pub mod transport;
pub mod transport_set;

pub use braid_core::{
    decode_timeout, encode_timeout, frame_message, http2, Attributes, CallOptions, CancellableContext,
    Code, Context, Deadline, Metadata, MetadataValue, Status,
};

pub use balancer::{
    DnsResolverFactory, EquivalentAddressGroup, LoadBalancer, LoadBalancerFactory, NameResolver,
    NameResolverFactory, NameResolverListener, PickFirstBalancerFactory, StaticResolverFactory,
};
pub use call::{ClientCall, ClientCallListener, MethodDescriptor, MethodType};
pub use channel::{ManagedChannel, ManagedChannelBuilder};
pub use server::{
    HandlerRegistry, ManagedServer, ManagedServerBuilder, ServerCall, ServerCallHandler,
    ServerCallListener,
};
pub use transport::mem::{InProcessServer, InProcessTransportFactory};
pub use transport::{
    ClientStream, ClientStreamListener, ClientTransport, ClientTransportFactory,
    ManagedClientTransport, PingCallback, TransportListener,
};
