//! A transport placeholder that buffers streams until a real connection
//! exists.
//!
//! While a connection is still being established (or an address has not yet
//! been resolved), calls land here. Each buffered stream records its creation
//! arguments and any operations performed on it; once a real transport is
//! supplied the buffered streams are created against it in arrival order and
//! their recorded operations replayed.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use braid_core::{Metadata, Status};

use crate::transport::{
    ClientStream, ClientStreamListener, ClientTransport, NoopClientStream, PingCallback,
    TransportListener,
};

type TransportSupplier = Box<dyn Fn() -> Arc<dyn ClientTransport> + Send + Sync>;

#[derive(Default)]
struct DelayedState {
    self_weak: Weak<DelayedClientTransport>,
    listener: Option<Box<dyn TransportListener>>,
    supplier: Option<Arc<TransportSupplier>>,
    pending: Vec<Arc<PendingStream>>,
    pending_pings: Vec<PingCallback>,
    shutdown: bool,
    terminated: bool,
    in_use: bool,
}

/// Buffers `new_stream` calls until a transport is supplied or the delayed
/// transport is shut down.
pub struct DelayedClientTransport {
    state: Mutex<DelayedState>,
}

impl DelayedClientTransport {
    pub fn new() -> Arc<DelayedClientTransport> {
        let transport = Arc::new(DelayedClientTransport {
            state: Mutex::new(DelayedState::default()),
        });
        transport.state.lock().self_weak = Arc::downgrade(&transport);
        transport
    }

    /// Registers the lifecycle listener. Called once by the owner.
    pub fn start(&self, listener: Box<dyn TransportListener>) {
        let mut state = self.state.lock();
        debug_assert!(state.listener.is_none(), "started twice");
        state.listener = Some(listener);
    }

    /// Supplies the real transport: buffered streams drain against it in
    /// arrival order and future streams go straight through.
    pub fn set_transport(&self, transport: Arc<dyn ClientTransport>) {
        self.set_transport_supplier(move || transport.clone());
    }

    /// Like [`set_transport`](Self::set_transport) but resolving the
    /// transport per drained stream.
    pub fn set_transport_supplier(
        &self,
        supplier: impl Fn() -> Arc<dyn ClientTransport> + Send + Sync + 'static,
    ) {
        let supplier: Arc<TransportSupplier> = Arc::new(Box::new(supplier));
        let (pending, pings) = {
            let mut state = self.state.lock();
            state.supplier = Some(supplier.clone());
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.pending_pings),
            )
        };
        for stream in pending {
            stream.realize(&supplier);
        }
        for ping in pings {
            supplier().ping(ping);
        }
        self.update_lifecycle();
    }

    /// Stops accepting new streams. Already-buffered streams still drain once
    /// a transport (or supplier) is set.
    pub fn shutdown(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.listener.take()
        };
        if let Some(mut listener) = listener {
            listener.transport_shutdown(Status::unavailable("delayed transport shutdown"));
            self.state.lock().listener = Some(listener);
        }
        self.update_lifecycle();
    }

    /// Fails every buffered stream with `error`.
    pub fn shutdown_now(&self, error: Status) {
        self.shutdown();
        let (pending, pings) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.pending_pings),
            )
        };
        for stream in pending {
            stream.fail(error.clone());
        }
        for ping in pings {
            ping(Err(error.clone()));
        }
        self.update_lifecycle();
    }

    pub fn has_pending_streams(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Re-evaluates in-use and termination after the pending set changed.
    fn update_lifecycle(&self) {
        let (edge, terminated, listener) = {
            let mut state = self.state.lock();
            let now_in_use = !state.pending.is_empty();
            let edge = if now_in_use != state.in_use {
                state.in_use = now_in_use;
                Some(now_in_use)
            } else {
                None
            };
            let terminate = state.shutdown && state.pending.is_empty() && !state.terminated;
            if terminate {
                state.terminated = true;
            }
            (edge, terminate, state.listener.take())
        };
        let Some(mut listener) = listener else {
            return;
        };
        if let Some(value) = edge {
            listener.transport_in_use(value);
        }
        if terminated {
            listener.transport_terminated();
        }
        self.state.lock().listener = Some(listener);
    }

    fn drop_pending(&self, stream: &PendingStream) {
        {
            let mut state = self.state.lock();
            state
                .pending
                .retain(|p| !std::ptr::eq(p.as_ref(), stream));
        }
        self.update_lifecycle();
    }
}

impl ClientTransport for DelayedClientTransport {
    fn new_stream(
        &self,
        method: &str,
        headers: Metadata,
        mut listener: Box<dyn ClientStreamListener>,
    ) -> Arc<dyn ClientStream> {
        enum Route {
            Through(Arc<TransportSupplier>),
            Refuse,
        }
        let route = {
            let mut state = self.state.lock();
            if let Some(supplier) = &state.supplier {
                Route::Through(supplier.clone())
            } else if state.shutdown {
                Route::Refuse
            } else {
                let pending = Arc::new(PendingStream {
                    owner: state.self_weak.clone(),
                    inner: Mutex::new(PendingInner {
                        create: Some(CreateArgs {
                            method: method.to_string(),
                            headers,
                            listener,
                        }),
                        real: None,
                        ops: Vec::new(),
                        cancelled: false,
                    }),
                });
                state.pending.push(pending.clone());
                drop(state);
                self.update_lifecycle();
                return pending;
            }
        };
        match route {
            Route::Through(supplier) => supplier().new_stream(method, headers, listener),
            Route::Refuse => {
                listener.on_close(
                    Status::unavailable("transport shutdown while stream was pending"),
                    Metadata::new(),
                );
                Arc::new(NoopClientStream)
            }
        }
    }

    fn ping(&self, callback: PingCallback) {
        enum Route {
            Through(Arc<TransportSupplier>),
            Refuse,
        }
        let route = {
            let mut state = self.state.lock();
            if let Some(supplier) = &state.supplier {
                Route::Through(supplier.clone())
            } else if state.shutdown {
                Route::Refuse
            } else {
                state.pending_pings.push(callback);
                return;
            }
        };
        match route {
            Route::Through(supplier) => supplier().ping(callback),
            Route::Refuse => callback(Err(Status::unavailable("delayed transport shutdown"))),
        }
    }
}

struct CreateArgs {
    method: String,
    headers: Metadata,
    listener: Box<dyn ClientStreamListener>,
}

enum Op {
    SendMessage(Bytes),
    HalfClose,
    Request(u32),
}

struct PendingInner {
    create: Option<CreateArgs>,
    real: Option<Arc<dyn ClientStream>>,
    ops: Vec<Op>,
    cancelled: bool,
}

/// A stream buffered inside the delayed transport.
pub struct PendingStream {
    owner: Weak<DelayedClientTransport>,
    inner: Mutex<PendingInner>,
}

impl PendingStream {
    /// Creates the real stream and replays buffered operations in order.
    fn realize(self: &Arc<Self>, supplier: &Arc<TransportSupplier>) {
        let (args, ops) = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            let Some(args) = inner.create.take() else {
                return;
            };
            (args, std::mem::take(&mut inner.ops))
        };
        let real = supplier().new_stream(&args.method, args.headers, args.listener);
        for op in ops {
            match op {
                Op::SendMessage(message) => real.send_message(message),
                Op::HalfClose => real.half_close(),
                Op::Request(count) => real.request(count),
            }
        }
        self.inner.lock().real = Some(real);
    }

    fn fail(&self, error: Status) {
        let listener = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.create.take().map(|args| args.listener)
        };
        if let Some(mut listener) = listener {
            listener.on_close(error, Metadata::new());
        }
    }
}

impl ClientStream for PendingStream {
    fn send_message(&self, message: Bytes) {
        let real = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            match &inner.real {
                Some(real) => real.clone(),
                None => {
                    inner.ops.push(Op::SendMessage(message));
                    return;
                }
            }
        };
        real.send_message(message);
    }

    fn half_close(&self) {
        let real = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            match &inner.real {
                Some(real) => real.clone(),
                None => {
                    inner.ops.push(Op::HalfClose);
                    return;
                }
            }
        };
        real.half_close();
    }

    fn cancel(&self, status: Status) {
        enum Action {
            Real(Arc<dyn ClientStream>),
            Local(Option<Box<dyn ClientStreamListener>>),
        }
        let action = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            match &inner.real {
                Some(real) => Action::Real(real.clone()),
                None => {
                    inner.cancelled = true;
                    Action::Local(inner.create.take().map(|args| args.listener))
                }
            }
        };
        match action {
            Action::Real(real) => real.cancel(status),
            Action::Local(listener) => {
                if let Some(mut listener) = listener {
                    listener.on_close(status, Metadata::new());
                }
                if let Some(owner) = self.owner.upgrade() {
                    owner.drop_pending(self);
                }
            }
        }
    }

    fn request(&self, count: u32) {
        let real = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            match &inner.real {
                Some(real) => real.clone(),
                None => {
                    inner.ops.push(Op::Request(count));
                    return;
                }
            }
        };
        real.request(count);
    }
}
