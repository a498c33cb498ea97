//! Per-address-group connection pooling.
//!
//! A [`TransportSet`] owns one [`EquivalentAddressGroup`] and at most one
//! connecting-or-connected transport at a time. Callers that arrive before a
//! connection is ready are parked on a shared [`DelayedClientTransport`];
//! when the connection becomes ready the buffered streams drain into it in
//! arrival order. Connect failures walk the address list, and a full failed
//! pass applies exponential backoff and tells the owner so it can refresh
//! name resolution.
//!
//! The owner is reached through [`TransportSetCallback`] carrying the address
//! group and the set's id, never a back-pointer, and every callback is
//! invoked with the set's lock released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use braid_core::Status;

use crate::backoff::{BackoffPolicy, BackoffPolicyProvider};
use crate::balancer::EquivalentAddressGroup;
use crate::delayed::DelayedClientTransport;
use crate::transport::{
    ClientTransport, ClientTransportFactory, FailingClientTransport, ManagedClientTransport,
    TransportListener,
};

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// In-use accounting source id for the delayed transport.
const DELAYED_SOURCE: u64 = u64::MAX;

/// How a [`TransportSet`] reports back to its owner.
pub trait TransportSetCallback: Send + Sync {
    /// The set has fully terminated after shutdown.
    fn on_terminated(&self, key: &EquivalentAddressGroup, set_id: u64);
    /// Every address in the group failed in one pass.
    fn on_all_addresses_failed(&self);
    /// An established connection was closed by the peer with a non-OK status.
    fn on_connection_closed_by_server(&self, status: Status);
    /// The set's aggregate in-use state crossed an edge.
    fn on_in_use(&self, key: &EquivalentAddressGroup, set_id: u64, in_use: bool);
}

struct SetState {
    shutdown: bool,
    terminated: bool,
    ready: bool,
    /// The connecting or connected transport, if any.
    active: Option<(u64, Arc<dyn ManagedClientTransport>)>,
    /// Transports that have not yet reported terminated.
    transports: Vec<(u64, Arc<dyn ManagedClientTransport>)>,
    delayed: Option<Arc<DelayedClientTransport>>,
    live_delayed: u32,
    next_address_index: usize,
    /// Present while a failure streak is in progress; cleared on success.
    backoff: Option<Box<dyn BackoffPolicy>>,
    reconnect_task: Option<JoinHandle<()>>,
    next_conn_id: u64,
    in_use_sources: std::collections::HashSet<u64>,
    in_use: bool,
}

/// A pool of at most one connection for one address group.
pub struct TransportSet {
    id: u64,
    address_group: EquivalentAddressGroup,
    authority: String,
    user_agent: String,
    factory: Arc<dyn ClientTransportFactory>,
    backoff_provider: Arc<dyn BackoffPolicyProvider>,
    callback: Arc<dyn TransportSetCallback>,
    state: Mutex<SetState>,
}

impl TransportSet {
    pub fn new(
        address_group: EquivalentAddressGroup,
        authority: impl Into<String>,
        user_agent: impl Into<String>,
        factory: Arc<dyn ClientTransportFactory>,
        backoff_provider: Arc<dyn BackoffPolicyProvider>,
        callback: Arc<dyn TransportSetCallback>,
    ) -> Arc<TransportSet> {
        assert!(!address_group.is_empty(), "empty address group");
        Arc::new(TransportSet {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            address_group,
            authority: authority.into(),
            user_agent: user_agent.into(),
            factory,
            backoff_provider,
            callback,
            state: Mutex::new(SetState {
                shutdown: false,
                terminated: false,
                ready: false,
                active: None,
                transports: Vec::new(),
                delayed: None,
                live_delayed: 0,
                next_address_index: 0,
                backoff: None,
                reconnect_task: None,
                next_conn_id: 1,
                in_use_sources: std::collections::HashSet::new(),
                in_use: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address_group(&self) -> &EquivalentAddressGroup {
        &self.address_group
    }

    /// The transport new calls should use: the ready connection when there is
    /// one, otherwise the shared delayed transport (starting a connect if
    /// none is in progress).
    pub fn obtain_active_transport(self: &Arc<Self>) -> Arc<dyn ClientTransport> {
        enum Obtained {
            Ready(Arc<dyn ManagedClientTransport>),
            Delayed(
                Arc<DelayedClientTransport>,
                Option<(u64, Arc<dyn ManagedClientTransport>)>,
            ),
            Failing(Status),
        }
        let obtained = {
            let mut state = self.state.lock();
            if state.shutdown {
                Obtained::Failing(Status::unavailable("transport set is shutdown"))
            } else if state.ready {
                let (_, transport) = state.active.as_ref().expect("ready without transport");
                Obtained::Ready(transport.clone())
            } else {
                let delayed = match &state.delayed {
                    Some(delayed) => delayed.clone(),
                    None => {
                        let delayed = DelayedClientTransport::new();
                        delayed.start(Box::new(DelayedSetListener {
                            set: Arc::downgrade(self),
                        }));
                        state.delayed = Some(delayed.clone());
                        state.live_delayed += 1;
                        delayed
                    }
                };
                let connecting = state.active.is_some() || state.reconnect_task.is_some();
                let to_start = if connecting {
                    None
                } else {
                    Some(self.start_connect_locked(&mut state))
                };
                Obtained::Delayed(delayed, to_start)
            }
        };
        match obtained {
            Obtained::Ready(transport) => transport,
            Obtained::Delayed(delayed, to_start) => {
                if let Some((conn_id, transport)) = to_start {
                    self.start_transport(conn_id, transport);
                }
                delayed
            }
            Obtained::Failing(status) => Arc::new(FailingClientTransport::new(status)),
        }
    }

    /// Stops connecting and shuts the pool down. Streams on a ready transport
    /// finish; buffered streams that have no connection to drain into are
    /// failed, since no further connect attempt will serve them.
    pub fn shutdown(&self) {
        let (active, delayed, task) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            (
                state.active.take().map(|(_, t)| t),
                state.delayed.take(),
                state.reconnect_task.take(),
            )
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(transport) = active {
            transport.shutdown();
        }
        if let Some(delayed) = delayed {
            if delayed.has_pending_streams() {
                delayed.shutdown_now(Status::unavailable("transport set is shutdown"));
            } else {
                delayed.shutdown();
            }
        }
        self.maybe_terminate();
    }

    /// Shuts down and additionally hard-fails every live transport.
    pub fn shutdown_now(&self, status: Status) {
        self.shutdown();
        let transports = {
            let state = self.state.lock();
            state.transports.clone()
        };
        for (_, transport) in transports {
            transport.shutdown_now(status.clone());
        }
    }

    fn start_connect_locked(
        self: &Arc<Self>,
        state: &mut SetState,
    ) -> (u64, Arc<dyn ManagedClientTransport>) {
        let address = self.address_group.addresses()[state.next_address_index];
        tracing::debug!(set_id = self.id, %address, "connecting");
        let transport = self
            .factory
            .new_transport(address, &self.authority, &self.user_agent);
        let conn_id = state.next_conn_id;
        state.next_conn_id += 1;
        state.active = Some((conn_id, transport.clone()));
        state.transports.push((conn_id, transport.clone()));
        (conn_id, transport)
    }

    fn start_transport(self: &Arc<Self>, conn_id: u64, transport: Arc<dyn ManagedClientTransport>) {
        transport.start(Box::new(SetTransportListener {
            set: Arc::downgrade(self),
            conn_id,
        }));
    }

    fn handle_transport_ready(self: &Arc<Self>, conn_id: u64) {
        let handoff = {
            let mut state = self.state.lock();
            match &state.active {
                Some((id, transport)) if *id == conn_id && !state.shutdown => {
                    let transport = transport.clone();
                    state.ready = true;
                    state.backoff = None;
                    state.next_address_index = 0;
                    state.delayed.take().map(|d| (d, transport))
                }
                _ => None,
            }
        };
        if let Some((delayed, transport)) = handoff {
            let target: Arc<dyn ClientTransport> = transport;
            delayed.set_transport(target);
            delayed.shutdown();
        }
    }

    fn handle_transport_shutdown(self: &Arc<Self>, conn_id: u64, status: Status) {
        enum Next {
            Nothing,
            ClosedByServer(Status),
            Connect(u64, Arc<dyn ManagedClientTransport>),
            AllFailed(std::time::Duration),
        }
        let next = {
            let mut state = self.state.lock();
            let is_active = matches!(&state.active, Some((id, _)) if *id == conn_id);
            if !is_active || state.shutdown {
                if is_active {
                    state.active = None;
                    state.ready = false;
                }
                Next::Nothing
            } else if state.ready {
                state.active = None;
                state.ready = false;
                let reconnect = state
                    .delayed
                    .as_ref()
                    .map(|d| d.has_pending_streams())
                    .unwrap_or(false);
                if reconnect {
                    let (id, transport) = self.start_connect_locked(&mut state);
                    drop(state);
                    self.start_transport(id, transport);
                    return self.callback.on_connection_closed_by_server(status);
                }
                Next::ClosedByServer(status)
            } else {
                // A connect attempt failed; walk the address list.
                state.active = None;
                state.next_address_index += 1;
                if state.next_address_index < self.address_group.len() {
                    let (id, transport) = self.start_connect_locked(&mut state);
                    Next::Connect(id, transport)
                } else {
                    state.next_address_index = 0;
                    if state.backoff.is_none() {
                        state.backoff = Some(self.backoff_provider.get());
                    }
                    let delay = state
                        .backoff
                        .as_mut()
                        .expect("backoff just installed")
                        .next_backoff();
                    let set = Arc::downgrade(self);
                    state.reconnect_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(set) = set.upgrade() {
                            set.retry_connect();
                        }
                    }));
                    Next::AllFailed(delay)
                }
            }
        };
        match next {
            Next::Nothing => {}
            Next::ClosedByServer(status) => {
                if !status.is_ok() {
                    self.callback.on_connection_closed_by_server(status);
                }
            }
            Next::Connect(id, transport) => self.start_transport(id, transport),
            Next::AllFailed(delay) => {
                tracing::debug!(set_id = self.id, ?delay, "all addresses failed; backing off");
                self.callback.on_all_addresses_failed();
            }
        }
    }

    fn retry_connect(self: &Arc<Self>) {
        let to_start = {
            let mut state = self.state.lock();
            state.reconnect_task = None;
            if state.shutdown || state.active.is_some() {
                None
            } else {
                Some(self.start_connect_locked(&mut state))
            }
        };
        if let Some((id, transport)) = to_start {
            self.start_transport(id, transport);
        }
    }

    fn handle_transport_terminated(self: &Arc<Self>, conn_id: u64) {
        {
            let mut state = self.state.lock();
            state.transports.retain(|(id, _)| *id != conn_id);
            if matches!(&state.active, Some((id, _)) if *id == conn_id) {
                state.active = None;
                state.ready = false;
            }
            state.in_use_sources.remove(&conn_id);
        }
        self.update_in_use(None);
        self.maybe_terminate();
    }

    fn handle_delayed_terminated(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.live_delayed = state.live_delayed.saturating_sub(1);
            state.in_use_sources.remove(&DELAYED_SOURCE);
        }
        self.update_in_use(None);
        self.maybe_terminate();
    }

    fn update_in_use(&self, change: Option<(u64, bool)>) {
        let edge = {
            let mut state = self.state.lock();
            if let Some((source, in_use)) = change {
                if in_use {
                    state.in_use_sources.insert(source);
                } else {
                    state.in_use_sources.remove(&source);
                }
            }
            let now = !state.in_use_sources.is_empty();
            if now != state.in_use {
                state.in_use = now;
                Some(now)
            } else {
                None
            }
        };
        if let Some(in_use) = edge {
            self.callback.on_in_use(&self.address_group, self.id, in_use);
        }
    }

    fn maybe_terminate(&self) {
        let terminated = {
            let mut state = self.state.lock();
            if !state.terminated
                && state.shutdown
                && state.transports.is_empty()
                && state.live_delayed == 0
            {
                state.terminated = true;
                true
            } else {
                false
            }
        };
        if terminated {
            tracing::debug!(set_id = self.id, "transport set terminated");
            self.callback.on_terminated(&self.address_group, self.id);
        }
    }
}

struct SetTransportListener {
    set: Weak<TransportSet>,
    conn_id: u64,
}

impl TransportListener for SetTransportListener {
    fn transport_ready(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.handle_transport_ready(self.conn_id);
        }
    }

    fn transport_shutdown(&mut self, status: Status) {
        if let Some(set) = self.set.upgrade() {
            set.handle_transport_shutdown(self.conn_id, status);
        }
    }

    fn transport_terminated(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.handle_transport_terminated(self.conn_id);
        }
    }

    fn transport_in_use(&mut self, in_use: bool) {
        if let Some(set) = self.set.upgrade() {
            set.update_in_use(Some((self.conn_id, in_use)));
        }
    }
}

struct DelayedSetListener {
    set: Weak<TransportSet>,
}

impl TransportListener for DelayedSetListener {
    fn transport_ready(&mut self) {}

    fn transport_shutdown(&mut self, _status: Status) {}

    fn transport_terminated(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.handle_delayed_terminated();
        }
    }

    fn transport_in_use(&mut self, in_use: bool) {
        if let Some(set) = self.set.upgrade() {
            set.update_in_use(Some((DELAYED_SOURCE, in_use)));
        }
    }
}
