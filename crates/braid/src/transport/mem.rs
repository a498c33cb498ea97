//! In-process transports over the in-memory codec pair.
//!
//! [`InProcessServer`] is an [`InternalServer`] whose "accept loop" is the
//! [`connect`](InProcessServer::connect) call: each connect builds a codec
//! pair, wires the server half into a server transport and hands the client
//! half back. [`InProcessTransportFactory`] plugs that into a channel, giving
//! a full client-to-server stack with no sockets. Tests and in-process
//! services are the intended users.

use std::sync::Arc;

use parking_lot::Mutex;

use braid_core::http2::mem::{codec_pair, MemCodec};
use braid_core::{Metadata, Status};

use super::client::{ClientTransportConfig, Http2ClientTransport};
use super::server::{Http2ServerTransport, ServerTransportConfig};
use super::{
    ClientStream, ClientStreamListener, ClientTransport, ClientTransportFactory, InternalServer,
    ManagedClientTransport, NoopClientStream, PingCallback, ServerListener, ServerTransport,
    TransportListener,
};

#[derive(Default)]
struct InProcessState {
    listener: Option<Box<dyn ServerListener>>,
    shutdown: bool,
}

/// An in-process "listening socket".
#[derive(Default)]
pub struct InProcessServer {
    state: Mutex<InProcessState>,
}

impl InProcessServer {
    pub fn new() -> InProcessServer {
        InProcessServer::default()
    }

    /// Establishes a connection, returning the client-side codec. Fails once
    /// the server has shut down or before it starts.
    pub fn connect(&self) -> Result<MemCodec, Status> {
        let (client, server) = codec_pair();
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(Status::unavailable("server is shut down"));
            }
            let Some(listener) = state.listener.as_mut() else {
                return Err(Status::unavailable("server is not accepting connections"));
            };
            let transport = Http2ServerTransport::new(server, ServerTransportConfig::default());
            let as_server_transport: Arc<dyn ServerTransport> = transport.clone();
            let transport_listener = listener.transport_created(as_server_transport);
            transport.start(transport_listener);
        }
        Ok(client)
    }
}

impl InternalServer for InProcessServer {
    fn start(&self, listener: Box<dyn ServerListener>) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.listener.is_some() {
            return Err(Status::internal("listener already started"));
        }
        if state.shutdown {
            return Err(Status::unavailable("server is shut down"));
        }
        state.listener = Some(listener);
        Ok(())
    }

    fn shutdown(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.listener.take()
        };
        if let Some(mut listener) = listener {
            listener.server_shutdown();
        }
    }
}

/// Client transport factory connecting to an [`InProcessServer`]. The socket
/// address is ignored beyond routing; resolvers still produce one so the
/// balancer and transport-set machinery run unchanged.
pub struct InProcessTransportFactory {
    server: Arc<InProcessServer>,
}

impl InProcessTransportFactory {
    pub fn new(server: Arc<InProcessServer>) -> InProcessTransportFactory {
        InProcessTransportFactory { server }
    }
}

impl ClientTransportFactory for InProcessTransportFactory {
    fn new_transport(
        &self,
        _address: std::net::SocketAddr,
        authority: &str,
        user_agent: &str,
    ) -> Arc<dyn ManagedClientTransport> {
        match self.server.connect() {
            Ok(codec) => Http2ClientTransport::new(
                codec,
                ClientTransportConfig::new(authority).with_user_agent(user_agent),
            ),
            Err(status) => Arc::new(RefusedTransport { status }),
        }
    }

    fn close(&self) {}
}

/// A transport whose connection attempt already failed; it reports the
/// failure through the lifecycle listener when started.
struct RefusedTransport {
    status: Status,
}

impl ClientTransport for RefusedTransport {
    fn new_stream(
        &self,
        _method: &str,
        _headers: Metadata,
        mut listener: Box<dyn ClientStreamListener>,
    ) -> Arc<dyn ClientStream> {
        listener.on_close(self.status.clone(), Metadata::new());
        Arc::new(NoopClientStream)
    }

    fn ping(&self, callback: PingCallback) {
        callback(Err(self.status.clone()));
    }
}

impl ManagedClientTransport for RefusedTransport {
    fn start(&self, mut listener: Box<dyn TransportListener>) {
        listener.transport_shutdown(self.status.clone());
        listener.transport_terminated();
    }

    fn shutdown(&self) {}

    fn shutdown_now(&self, _status: Status) {}
}
