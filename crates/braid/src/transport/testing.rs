//! Shared test doubles for the transport layer.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use braid_core::{Metadata, Status};

use super::{
    ClientStream, ClientStreamListener, ClientTransport, ManagedClientTransport, PingCallback,
    TransportListener,
};

/// Records listener callbacks as readable strings.
pub(crate) struct RecordingStreamListener {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingStreamListener {
    pub(crate) fn new() -> (RecordingStreamListener, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            RecordingStreamListener {
                events: events.clone(),
            },
            events,
        )
    }
}

impl ClientStreamListener for RecordingStreamListener {
    fn on_headers(&mut self, headers: Metadata) {
        self.events.lock().push(format!("headers({})", headers.len()));
    }

    fn on_message(&mut self, message: Bytes) {
        self.events
            .lock()
            .push(format!("message({})", String::from_utf8_lossy(&message)));
    }

    fn on_close(&mut self, status: Status, _trailers: Metadata) {
        let event = match status.description() {
            Some(d) => format!("close:{}:{}", status.code(), d),
            None => format!("close:{}", status.code()),
        };
        self.events.lock().push(event);
    }
}

struct RecordedStream {
    method: String,
    ops: Arc<Mutex<Vec<(String, String)>>>,
}

impl ClientStream for RecordedStream {
    fn send_message(&self, message: Bytes) {
        self.ops
            .lock()
            .push((self.method.clone(), format!("send({})", message.len())));
    }

    fn half_close(&self) {
        self.ops
            .lock()
            .push((self.method.clone(), "half_close".to_string()));
    }

    fn cancel(&self, status: Status) {
        self.ops
            .lock()
            .push((self.method.clone(), format!("cancel({})", status.code())));
    }

    fn request(&self, count: u32) {
        self.ops
            .lock()
            .push((self.method.clone(), format!("request({})", count)));
    }
}

/// A transport that records stream creations and per-stream operations.
pub(crate) struct RecordingTransport {
    created: Mutex<Vec<String>>,
    ops: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> RecordingTransport {
        RecordingTransport {
            created: Mutex::new(Vec::new()),
            ops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub(crate) fn stream_ops(&self, method: &str) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, op)| op.clone())
            .collect()
    }
}

impl ClientTransport for RecordingTransport {
    fn new_stream(
        &self,
        method: &str,
        _headers: Metadata,
        _listener: Box<dyn ClientStreamListener>,
    ) -> Arc<dyn ClientStream> {
        self.created.lock().push(method.to_string());
        Arc::new(RecordedStream {
            method: method.to_string(),
            ops: self.ops.clone(),
        })
    }

    fn ping(&self, callback: PingCallback) {
        callback(Ok(std::time::Duration::from_micros(1)));
    }
}

/// What a scripted connect attempt does when started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    /// Report ready immediately.
    Ready,
    /// Report shutdown immediately (connection refused).
    Fail,
    /// Do nothing; the test drives the listener by hand.
    Hang,
}

pub(crate) struct ScriptedTransport {
    pub(crate) address: std::net::SocketAddr,
    outcome: ConnectOutcome,
    pub(crate) listener: Mutex<Option<Box<dyn TransportListener>>>,
    pub(crate) inner: Arc<RecordingTransport>,
    pub(crate) shutdowns: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    /// Drives a lifecycle event from the test.
    pub(crate) fn fire(&self, event: impl FnOnce(&mut dyn TransportListener)) {
        let mut guard = self.listener.lock();
        if let Some(listener) = guard.as_mut() {
            event(listener.as_mut());
        }
    }
}

impl ClientTransport for ScriptedTransport {
    fn new_stream(
        &self,
        method: &str,
        headers: Metadata,
        listener: Box<dyn ClientStreamListener>,
    ) -> Arc<dyn ClientStream> {
        self.inner.new_stream(method, headers, listener)
    }

    fn ping(&self, callback: PingCallback) {
        self.inner.ping(callback);
    }
}

impl ManagedClientTransport for ScriptedTransport {
    fn start(&self, mut listener: Box<dyn TransportListener>) {
        match self.outcome {
            ConnectOutcome::Ready => listener.transport_ready(),
            ConnectOutcome::Fail => {
                listener.transport_shutdown(Status::unavailable("connection refused"));
                listener.transport_terminated();
            }
            ConnectOutcome::Hang => {}
        }
        *self.listener.lock() = Some(listener);
    }

    fn shutdown(&self) {
        self.shutdowns.lock().push("shutdown".to_string());
    }

    fn shutdown_now(&self, status: Status) {
        self.shutdowns
            .lock()
            .push(format!("shutdown_now({})", status.code()));
    }
}

/// A factory producing scripted transports; outcomes are consumed in order,
/// repeating the last one.
pub(crate) struct ScriptedTransportFactory {
    outcomes: Mutex<Vec<ConnectOutcome>>,
    pub(crate) transports: Mutex<Vec<Arc<ScriptedTransport>>>,
    pub(crate) closed: Mutex<bool>,
}

impl ScriptedTransportFactory {
    pub(crate) fn new(outcomes: Vec<ConnectOutcome>) -> ScriptedTransportFactory {
        ScriptedTransportFactory {
            outcomes: Mutex::new(outcomes),
            transports: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    pub(crate) fn transport(&self, index: usize) -> Arc<ScriptedTransport> {
        self.transports.lock()[index].clone()
    }

    pub(crate) fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }
}

impl super::ClientTransportFactory for ScriptedTransportFactory {
    fn new_transport(
        &self,
        address: std::net::SocketAddr,
        _authority: &str,
        _user_agent: &str,
    ) -> Arc<dyn ManagedClientTransport> {
        let outcome = {
            let mut outcomes = self.outcomes.lock();
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes.first().copied().unwrap_or(ConnectOutcome::Ready)
            }
        };
        let transport = Arc::new(ScriptedTransport {
            address,
            outcome,
            listener: Mutex::new(None),
            inner: Arc::new(RecordingTransport::new()),
            shutdowns: Mutex::new(Vec::new()),
        });
        self.transports.lock().push(transport.clone());
        transport
    }

    fn close(&self) {
        *self.closed.lock() = true;
    }
}
