//! The managed client channel.
//!
//! A [`ManagedChannel`] is the call entry point on the client. It owns the
//! name resolver, the load balancer, the per-address-group [`TransportSet`]s,
//! the idle-mode timer and shutdown orchestration. All channel state sits
//! behind one mutex; anything slow that must happen as a consequence of a
//! state change (starting a resolver, shutting down balancers and
//! transports) is extracted as an action and run after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use http::Uri;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use braid_core::{Attributes, CallOptions, Status};

use crate::backoff::{BackoffPolicyProvider, ExponentialBackoffProvider};
use crate::balancer::{
    DnsResolverFactory, EquivalentAddressGroup, InterimTransport, LoadBalancer,
    LoadBalancerFactory, NameResolver, NameResolverFactory, NameResolverListener,
    PickFirstBalancerFactory, TransportManager,
};
use crate::call::{ClientCall, ClientTransportProvider, MethodDescriptor};
use crate::delayed::DelayedClientTransport;
use crate::executor::shared_callback_executor;
use crate::transport::{
    grpc_user_agent, ClientTransport, ClientTransportFactory, FailingClientTransport,
};
use crate::transport_set::{TransportSet, TransportSetCallback};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1 << 32);

type Action = Box<dyn FnOnce() + Send>;

/// Builds a [`ManagedChannel`].
pub struct ManagedChannelBuilder {
    target: String,
    name_resolver_factory: Arc<dyn NameResolverFactory>,
    load_balancer_factory: Arc<dyn LoadBalancerFactory>,
    transport_factory: Option<Arc<dyn ClientTransportFactory>>,
    backoff_provider: Arc<dyn BackoffPolicyProvider>,
    resolver_params: Attributes,
    user_agent: Option<String>,
    idle_timeout: Option<Duration>,
}

impl ManagedChannelBuilder {
    pub fn new(target: impl Into<String>) -> ManagedChannelBuilder {
        ManagedChannelBuilder {
            target: target.into(),
            name_resolver_factory: Arc::new(DnsResolverFactory),
            load_balancer_factory: Arc::new(PickFirstBalancerFactory),
            transport_factory: None,
            backoff_provider: Arc::new(ExponentialBackoffProvider),
            resolver_params: Attributes::new(),
            user_agent: None,
            idle_timeout: None,
        }
    }

    pub fn name_resolver_factory(
        mut self,
        factory: Arc<dyn NameResolverFactory>,
    ) -> ManagedChannelBuilder {
        self.name_resolver_factory = factory;
        self
    }

    pub fn load_balancer_factory(
        mut self,
        factory: Arc<dyn LoadBalancerFactory>,
    ) -> ManagedChannelBuilder {
        self.load_balancer_factory = factory;
        self
    }

    pub fn transport_factory(
        mut self,
        factory: Arc<dyn ClientTransportFactory>,
    ) -> ManagedChannelBuilder {
        self.transport_factory = Some(factory);
        self
    }

    pub fn backoff_provider(
        mut self,
        provider: Arc<dyn BackoffPolicyProvider>,
    ) -> ManagedChannelBuilder {
        self.backoff_provider = provider;
        self
    }

    /// Application user-agent prefix; the runtime token is always appended.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> ManagedChannelBuilder {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Enters idle mode after this long without active streams.
    pub fn idle_timeout(mut self, timeout: Duration) -> ManagedChannelBuilder {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Fails if the target has no matching name resolver or no transport
    /// factory was supplied.
    pub fn build(self) -> Result<ManagedChannel, Status> {
        let transport_factory = self
            .transport_factory
            .ok_or_else(|| Status::invalid_argument("no transport factory configured"))?;
        let resolver = get_name_resolver(
            &self.target,
            self.name_resolver_factory.as_ref(),
            &self.resolver_params,
        )?;
        let executor = shared_callback_executor().get();
        let user_agent = grpc_user_agent(self.user_agent.as_deref());
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| ChannelInner {
            self_weak: weak.clone(),
            target: self.target,
            user_agent,
            idle_timeout: self.idle_timeout,
            resolver_factory: self.name_resolver_factory,
            resolver_params: self.resolver_params,
            balancer_factory: self.load_balancer_factory,
            transport_factory,
            backoff_provider: self.backoff_provider,
            executor,
            terminated_notify: Notify::new(),
            lock: Mutex::new(ChannelState {
                shutdown: false,
                shutdown_nowed: false,
                terminated: false,
                resolver,
                balancer: None,
                transports: HashMap::new(),
                decommissioned: Vec::new(),
                delayed: Vec::new(),
                oob: Vec::new(),
                in_use_sources: HashSet::new(),
                in_use: false,
                idle_timer: None,
            }),
        });
        tracing::debug!(target = %inner.target, "channel created");
        Ok(ManagedChannel { inner })
    }
}

/// Finds a resolver for a target: first as written (when it carries a
/// scheme), then with the factory's default scheme prepended, treating the
/// original string as the name.
fn get_name_resolver(
    target: &str,
    factory: &dyn NameResolverFactory,
    params: &Attributes,
) -> Result<Arc<dyn NameResolver>, Status> {
    if let Some(uri) = parse_target(target) {
        if uri.scheme_str().is_some() {
            if let Some(resolver) = factory.new_name_resolver(&uri, params) {
                return Ok(resolver);
            }
        }
    }
    let with_default = format!("{}://{}", factory.default_scheme(), target);
    if let Some(uri) = parse_target(&with_default) {
        if let Some(resolver) = factory.new_name_resolver(&uri, params) {
            return Ok(resolver);
        }
    }
    Err(Status::invalid_argument(format!(
        "cannot find a name resolver for {}",
        target
    )))
}

/// Parses a channel target, accepting both `scheme://name` and the
/// `scheme:///name` form.
fn parse_target(target: &str) -> Option<Uri> {
    let normalized = match target.find(":///") {
        Some(idx) => format!("{}://{}", &target[..idx], &target[idx + 4..]),
        None => target.to_string(),
    };
    normalized.parse::<Uri>().ok()
}

struct IdleTimer {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct ChannelState {
    shutdown: bool,
    shutdown_nowed: bool,
    terminated: bool,
    resolver: Arc<dyn NameResolver>,
    /// `None` while the channel is idle.
    balancer: Option<Arc<dyn LoadBalancer>>,
    transports: HashMap<EquivalentAddressGroup, Arc<TransportSet>>,
    /// Sets displaced by idle mode: still serving existing streams, no
    /// longer indexed by address group.
    decommissioned: Vec<Arc<TransportSet>>,
    delayed: Vec<Arc<DelayedClientTransport>>,
    oob: Vec<Arc<TransportSet>>,
    in_use_sources: HashSet<u64>,
    in_use: bool,
    idle_timer: Option<IdleTimer>,
}

struct ChannelInner {
    self_weak: Weak<ChannelInner>,
    target: String,
    user_agent: String,
    idle_timeout: Option<Duration>,
    resolver_factory: Arc<dyn NameResolverFactory>,
    resolver_params: Attributes,
    balancer_factory: Arc<dyn LoadBalancerFactory>,
    transport_factory: Arc<dyn ClientTransportFactory>,
    backoff_provider: Arc<dyn BackoffPolicyProvider>,
    executor: tokio::runtime::Handle,
    terminated_notify: Notify,
    lock: Mutex<ChannelState>,
}

impl ChannelInner {
    /// Leaves idle mode if the channel is in it. The returned action (the
    /// resolver start) must run after the lock is released.
    fn exit_idle_mode(self: &Arc<Self>, state: &mut ChannelState) -> Option<Action> {
        if state.shutdown {
            return None;
        }
        if state.in_use {
            self.cancel_idle_timer(state);
        } else {
            // Called outside the in-use aggregator: arm the timer, which the
            // aggregator cancels as soon as real use arrives.
            self.reschedule_idle_timer(state);
        }
        if state.balancer.is_some() {
            return None;
        }
        let authority = state.resolver.service_authority();
        let manager: Arc<dyn TransportManager> = self.clone();
        let balancer = self.balancer_factory.new_load_balancer(&authority, manager);
        state.balancer = Some(balancer.clone());
        let resolver = state.resolver.clone();
        tracing::debug!(target = %self.target, "exiting idle mode");
        Some(Box::new(move || {
            resolver.start(Arc::new(ResolverListener { balancer }));
        }))
    }

    fn cancel_idle_timer(&self, state: &mut ChannelState) {
        if let Some(timer) = state.idle_timer.take() {
            timer.cancelled.store(true, Ordering::SeqCst);
            timer.task.abort();
        }
    }

    fn reschedule_idle_timer(self: &Arc<Self>, state: &mut ChannelState) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        self.cancel_idle_timer(state);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let weak = self.self_weak.clone();
        let task = self.executor.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.idle_timer_fired(&flag);
            }
        });
        state.idle_timer = Some(IdleTimer { cancelled, task });
    }

    /// Enters idle mode: drop the balancer, replace the resolver with a
    /// fresh instance, decommission every transport set.
    fn idle_timer_fired(self: &Arc<Self>, cancelled: &AtomicBool) {
        let (sets, balancer, old_resolver) = {
            let mut state = self.lock.lock();
            if cancelled.load(Ordering::SeqCst) {
                // The timer raced with new use; the cancel won.
                return;
            }
            state.idle_timer = None;
            let Some(balancer) = state.balancer.take() else {
                return;
            };
            let fresh = get_name_resolver(
                &self.target,
                self.resolver_factory.as_ref(),
                &self.resolver_params,
            )
            .expect("resolver factory accepted this target at build time");
            let old_resolver = std::mem::replace(&mut state.resolver, fresh);
            let sets: Vec<Arc<TransportSet>> = state.transports.drain().map(|(_, ts)| ts).collect();
            state.decommissioned.extend(sets.iter().cloned());
            (sets, balancer, old_resolver)
        };
        tracing::debug!(target = %self.target, "entering idle mode");
        for set in sets {
            set.shutdown();
        }
        balancer.shutdown();
        old_resolver.shutdown();
    }

    /// In-use edge aggregation across transport sets and delayed transports.
    /// Effects run outside the lock.
    fn update_in_use(self: &Arc<Self>, source: u64, in_use: bool) {
        let action = {
            let mut state = self.lock.lock();
            if in_use {
                state.in_use_sources.insert(source);
            } else {
                state.in_use_sources.remove(&source);
            }
            let now = !state.in_use_sources.is_empty();
            if now == state.in_use {
                None
            } else {
                state.in_use = now;
                if now {
                    self.exit_idle_mode(&mut state)
                } else {
                    if !state.shutdown {
                        self.reschedule_idle_timer(&mut state);
                    }
                    None
                }
            }
        };
        if let Some(action) = action {
            action();
        }
    }

    fn refresh_resolver(&self) {
        let resolver = self.lock.lock().resolver.clone();
        resolver.refresh();
    }

    fn transport_set_terminated(self: &Arc<Self>, key: &EquivalentAddressGroup, set_id: u64) {
        let became_terminated = {
            let mut state = self.lock.lock();
            if state.transports.get(key).map(|ts| ts.id()) == Some(set_id) {
                state.transports.remove(key);
            }
            state.decommissioned.retain(|ts| ts.id() != set_id);
            state.oob.retain(|ts| ts.id() != set_id);
            self.maybe_terminate(&mut state)
        };
        self.update_in_use(set_id, false);
        if became_terminated {
            self.finish_termination();
        }
    }

    fn delayed_terminated(self: &Arc<Self>, delayed: &DelayedClientTransport, source: u64) {
        let became_terminated = {
            let mut state = self.lock.lock();
            state
                .delayed
                .retain(|d| !std::ptr::eq(d.as_ref(), delayed));
            self.maybe_terminate(&mut state)
        };
        self.update_in_use(source, false);
        if became_terminated {
            self.finish_termination();
        }
    }

    fn maybe_terminate(&self, state: &mut ChannelState) -> bool {
        if !state.terminated
            && state.shutdown
            && state.transports.is_empty()
            && state.decommissioned.is_empty()
            && state.delayed.is_empty()
            && state.oob.is_empty()
        {
            state.terminated = true;
            true
        } else {
            false
        }
    }

    fn finish_termination(&self) {
        tracing::debug!(target = %self.target, "channel terminated");
        self.terminated_notify.notify_waiters();
        self.transport_factory.close();
        shared_callback_executor().release();
    }

    fn shutdown(self: &Arc<Self>) {
        enum AfterLock {
            Done,
            Work {
                sets: Vec<Arc<TransportSet>>,
                delayed: Vec<Arc<DelayedClientTransport>>,
                oob: Vec<Arc<TransportSet>>,
                balancer: Option<Arc<dyn LoadBalancer>>,
                resolver: Arc<dyn NameResolver>,
                became_terminated: bool,
            },
        }
        let after = {
            let mut state = self.lock.lock();
            if state.shutdown {
                AfterLock::Done
            } else {
                state.shutdown = true;
                self.cancel_idle_timer(&mut state);
                let became_terminated = self.maybe_terminate(&mut state);
                AfterLock::Work {
                    sets: state.transports.values().cloned().collect(),
                    delayed: state.delayed.clone(),
                    oob: state.oob.clone(),
                    balancer: state.balancer.take(),
                    resolver: state.resolver.clone(),
                    became_terminated,
                }
            }
        };
        let AfterLock::Work {
            sets,
            delayed,
            oob,
            balancer,
            resolver,
            became_terminated,
        } = after
        else {
            return;
        };
        tracing::debug!(target = %self.target, "shutting down");
        if let Some(balancer) = balancer {
            balancer.shutdown();
        }
        resolver.shutdown();
        for set in sets {
            set.shutdown();
        }
        for transport in delayed {
            transport.shutdown();
        }
        for set in oob {
            set.shutdown();
        }
        if became_terminated {
            self.finish_termination();
        }
    }

    fn shutdown_now(self: &Arc<Self>) {
        {
            let mut state = self.lock.lock();
            if state.shutdown_nowed {
                return;
            }
            state.shutdown_nowed = true;
        }
        self.shutdown();
        let (sets, delayed, oob) = {
            let state = self.lock.lock();
            let mut sets: Vec<Arc<TransportSet>> = state.transports.values().cloned().collect();
            sets.extend(state.decommissioned.iter().cloned());
            (sets, state.delayed.clone(), state.oob.clone())
        };
        let status = Status::unavailable("Channel shutdownNow invoked");
        for set in sets {
            set.shutdown_now(status.clone());
        }
        for transport in delayed {
            transport.shutdown_now(status.clone());
        }
        for set in oob {
            set.shutdown_now(status.clone());
        }
    }

    fn new_transport_set(
        self: &Arc<Self>,
        group: &EquivalentAddressGroup,
        authority: String,
    ) -> Arc<TransportSet> {
        TransportSet::new(
            group.clone(),
            authority,
            self.user_agent.clone(),
            self.transport_factory.clone(),
            self.backoff_provider.clone(),
            Arc::new(SetCallback {
                inner: self.self_weak.clone(),
            }),
        )
    }
}

impl TransportManager for ChannelInner {
    fn get_transport(&self, group: &EquivalentAddressGroup) -> Arc<dyn ClientTransport> {
        let this = self.self_weak.upgrade().expect("channel inner alive");
        enum Got {
            Set(Arc<TransportSet>),
            Failing(Status),
        }
        let got = {
            let mut state = this.lock.lock();
            if state.shutdown {
                Got::Failing(Status::unavailable("Channel is shutdown"))
            } else if state.balancer.is_none() {
                Got::Failing(Status::internal("Channel is in idle mode"))
            } else {
                match state.transports.get(group) {
                    Some(set) => Got::Set(set.clone()),
                    None => {
                        let authority = state.resolver.service_authority();
                        let set = this.new_transport_set(group, authority);
                        tracing::debug!(set_id = set.id(), ?group, "transport set created");
                        state.transports.insert(group.clone(), set.clone());
                        Got::Set(set)
                    }
                }
            }
        };
        match got {
            Got::Set(set) => set.obtain_active_transport(),
            Got::Failing(status) => Arc::new(FailingClientTransport::new(status)),
        }
    }

    fn create_failing_transport(&self, error: Status) -> Arc<dyn ClientTransport> {
        Arc::new(FailingClientTransport::new(error))
    }

    fn create_interim_transport(&self) -> Arc<InterimTransport> {
        let this = self.self_weak.upgrade().expect("channel inner alive");
        let delayed = DelayedClientTransport::new();
        let source = NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed);
        delayed.start(Box::new(DelayedChannelListener {
            inner: this.self_weak.clone(),
            delayed: Arc::downgrade(&delayed),
            source,
        }));
        let shut_down_immediately = {
            let mut state = this.lock.lock();
            if state.shutdown {
                true
            } else {
                state.delayed.push(delayed.clone());
                false
            }
        };
        if shut_down_immediately {
            delayed.set_transport(Arc::new(FailingClientTransport::new(Status::unavailable(
                "Channel is shutdown",
            ))));
            delayed.shutdown();
        }
        InterimTransport::new(delayed)
    }

    fn create_oob_transport_provider(
        &self,
        group: &EquivalentAddressGroup,
        authority: &str,
    ) -> Arc<OobTransportProvider> {
        let this = self.self_weak.upgrade().expect("channel inner alive");
        let mut state = this.lock.lock();
        if state.shutdown {
            return Arc::new(OobTransportProvider {
                set: None,
                failing: Some(Status::unavailable("Channel is shutdown")),
            });
        }
        if state.balancer.is_none() {
            return Arc::new(OobTransportProvider {
                set: None,
                failing: Some(Status::internal("Channel is in idle mode")),
            });
        }
        let set = this.new_transport_set(group, authority.to_string());
        state.oob.push(set.clone());
        Arc::new(OobTransportProvider {
            set: Some(set),
            failing: None,
        })
    }
}

/// An out-of-band transport source: a transport set outside the channel's
/// address-group map, for balancers that talk to their own backends.
pub struct OobTransportProvider {
    set: Option<Arc<TransportSet>>,
    failing: Option<Status>,
}

impl OobTransportProvider {
    /// A provider that fails every request with `status`.
    pub(crate) fn failing(status: Status) -> Arc<OobTransportProvider> {
        Arc::new(OobTransportProvider {
            set: None,
            failing: Some(status),
        })
    }

    pub fn get(&self) -> Arc<dyn ClientTransport> {
        match (&self.set, &self.failing) {
            (Some(set), _) => set.obtain_active_transport(),
            (None, Some(status)) => Arc::new(FailingClientTransport::new(status.clone())),
            (None, None) => unreachable!("provider without set or failure"),
        }
    }

    pub fn close(&self) {
        if let Some(set) = &self.set {
            set.shutdown();
        }
    }

    pub(crate) fn shutdown_now(&self, status: Status) {
        if let Some(set) = &self.set {
            set.shutdown_now(status);
        }
    }
}

impl ClientTransportProvider for ChannelInner {
    fn get_transport(&self, options: &CallOptions) -> Arc<dyn ClientTransport> {
        let this = self.self_weak.upgrade().expect("channel inner alive");
        let (action, balancer) = {
            let mut state = this.lock.lock();
            let action = this.exit_idle_mode(&mut state);
            (action, state.balancer.clone())
        };
        if let Some(action) = action {
            action();
        }
        match balancer {
            Some(balancer) => balancer.pick_transport(options.affinity()),
            None => Arc::new(FailingClientTransport::new(Status::unavailable(
                "Channel is shutdown",
            ))),
        }
    }
}

struct SetCallback {
    inner: Weak<ChannelInner>,
}

impl TransportSetCallback for SetCallback {
    fn on_terminated(&self, key: &EquivalentAddressGroup, set_id: u64) {
        if let Some(inner) = self.inner.upgrade() {
            inner.transport_set_terminated(key, set_id);
        }
    }

    fn on_all_addresses_failed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.refresh_resolver();
        }
    }

    fn on_connection_closed_by_server(&self, _status: Status) {
        if let Some(inner) = self.inner.upgrade() {
            inner.refresh_resolver();
        }
    }

    fn on_in_use(&self, _key: &EquivalentAddressGroup, set_id: u64, in_use: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.update_in_use(set_id, in_use);
        }
    }
}

struct DelayedChannelListener {
    inner: Weak<ChannelInner>,
    delayed: Weak<DelayedClientTransport>,
    source: u64,
}

impl crate::transport::TransportListener for DelayedChannelListener {
    fn transport_ready(&mut self) {}

    fn transport_shutdown(&mut self, _status: Status) {}

    fn transport_terminated(&mut self) {
        if let (Some(inner), Some(delayed)) = (self.inner.upgrade(), self.delayed.upgrade()) {
            inner.delayed_terminated(delayed.as_ref(), self.source);
        }
    }

    fn transport_in_use(&mut self, in_use: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.update_in_use(self.source, in_use);
        }
    }
}

struct ResolverListener {
    balancer: Arc<dyn LoadBalancer>,
}

impl NameResolverListener for ResolverListener {
    fn on_update(&self, groups: Vec<EquivalentAddressGroup>, config: Attributes) {
        if groups.iter().all(|g| g.is_empty()) {
            self.balancer.handle_name_resolution_error(Status::unavailable(
                "name resolver returned an empty list",
            ));
            return;
        }
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.balancer.handle_resolved_addresses(groups, config)
        }));
        if let Err(payload) = outcome {
            // A broken balancer still gets told, in the hope the error
            // reaches the application.
            self.balancer.handle_name_resolution_error(
                Status::from_panic(payload.as_ref())
                    .augment_description("thrown from handle_resolved_addresses"),
            );
        }
    }

    fn on_error(&self, error: Status) {
        debug_assert!(!error.is_ok(), "resolution error must not be OK");
        self.balancer.handle_name_resolution_error(error);
    }
}

/// The client-side channel handle. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct ManagedChannel {
    inner: Arc<ChannelInner>,
}

impl ManagedChannel {
    pub fn builder(target: impl Into<String>) -> ManagedChannelBuilder {
        ManagedChannelBuilder::new(target)
    }

    /// Creates a call. Never blocks and always succeeds; on a shut-down
    /// channel the returned call fails at `start` with UNAVAILABLE.
    pub fn new_call(&self, method: MethodDescriptor, options: CallOptions) -> ClientCall {
        let provider: Arc<dyn ClientTransportProvider> = self.inner.clone();
        ClientCall::new(method, options, provider, self.inner.executor.clone())
    }

    /// The authority calls on this channel are addressed to.
    pub fn authority(&self) -> String {
        let resolver = self.inner.lock.lock().resolver.clone();
        resolver.service_authority()
    }

    /// Starts an orderly shutdown: existing calls continue, new calls fail,
    /// no new transports are created. Idempotent; returns immediately.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// [`shutdown`](Self::shutdown), then cancels every live transport with
    /// UNAVAILABLE.
    pub fn shutdown_now(&self) {
        self.inner.shutdown_now();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock.lock().shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock.lock().terminated
    }

    /// Waits until the channel terminates or the timeout elapses; returns
    /// whether it terminated.
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

#[cfg(test)]
impl ManagedChannel {
    pub(crate) fn has_balancer(&self) -> bool {
        self.inner.lock.lock().balancer.is_some()
    }

    pub(crate) fn transport_set_count(&self) -> usize {
        self.inner.lock.lock().transports.len()
    }

    pub(crate) fn oob_provider_for_test(
        &self,
        group: &EquivalentAddressGroup,
        authority: &str,
    ) -> Arc<OobTransportProvider> {
        TransportManager::create_oob_transport_provider(self.inner.as_ref(), group, authority)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::balancer::StaticResolverFactory;
    use crate::call::{ClientCallListener, MethodType};
    use crate::transport::testing::{ConnectOutcome, ScriptedTransportFactory};
    use braid_core::{Code, Metadata};
    use bytes::Bytes;

    struct CountingListener {
        closes: Arc<Mutex<Vec<String>>>,
    }

    impl ClientCallListener for CountingListener {
        fn on_message(&mut self, _message: Bytes) {}

        fn on_close(&mut self, status: Status, _trailers: Metadata) {
            self.closes.lock().push(format!(
                "{}:{}",
                status.code(),
                status.description().unwrap_or("")
            ));
        }
    }

    fn test_channel(
        factory: Arc<ScriptedTransportFactory>,
        idle: Option<Duration>,
    ) -> ManagedChannel {
        let mut builder = ManagedChannel::builder("static:///inproc")
            .name_resolver_factory(Arc::new(StaticResolverFactory::new(vec![
                "127.0.0.1:1".parse().unwrap()
            ])))
            .transport_factory(factory);
        if let Some(idle) = idle {
            builder = builder.idle_timeout(idle);
        }
        builder.build().expect("channel builds")
    }

    fn start_call(channel: &ManagedChannel) -> (ClientCall, Arc<Mutex<Vec<String>>>) {
        let call = channel.new_call(
            MethodDescriptor::new("svc/method", MethodType::Unary),
            CallOptions::new(),
        );
        let closes = Arc::new(Mutex::new(Vec::new()));
        call.start(
            CountingListener {
                closes: closes.clone(),
            },
            Metadata::new(),
        );
        (call, closes)
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_drops_the_balancer_and_next_call_restores_it() {
        let factory = Arc::new(ScriptedTransportFactory::new(vec![ConnectOutcome::Hang]));
        let channel = test_channel(factory.clone(), Some(Duration::from_millis(100)));
        assert!(!channel.has_balancer(), "channel starts idle");

        let (call, _closes) = start_call(&channel);
        assert!(channel.has_balancer());
        assert_eq!(channel.transport_set_count(), 1);

        // The last active stream goes away; idle mode follows.
        call.cancel("done with it", None);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!channel.has_balancer(), "idle entered");
        assert_eq!(channel.transport_set_count(), 0);

        // The next call exits idle: new balancer, new transport set.
        let (_call2, _closes2) = start_call(&channel);
        assert!(channel.has_balancer());
        assert_eq!(channel.transport_set_count(), 1);
        assert_eq!(factory.transport_count(), 2);
    }

    #[tokio::test]
    async fn new_use_cancels_a_pending_idle_timer() {
        let factory = Arc::new(ScriptedTransportFactory::new(vec![ConnectOutcome::Hang]));
        let channel = test_channel(factory.clone(), Some(Duration::from_secs(3600)));
        let (_call, _closes) = start_call(&channel);
        assert!(channel.has_balancer());
        // The in-use edge cancelled the armed timer under the lock; nothing
        // observable should change while the call is live.
        tokio::task::yield_now().await;
        assert!(channel.has_balancer());
    }

    #[tokio::test]
    async fn shutdown_fails_new_calls_and_terminates() {
        let factory = Arc::new(ScriptedTransportFactory::new(vec![ConnectOutcome::Hang]));
        let channel = test_channel(factory.clone(), None);
        let (_parked, parked_closes) = start_call(&channel);
        assert_eq!(channel.transport_set_count(), 1);

        channel.shutdown();
        channel.shutdown(); // idempotent
        assert!(channel.is_shutdown());
        wait_for(|| !parked_closes.lock().is_empty()).await;
        assert!(parked_closes.lock()[0].starts_with("UNAVAILABLE"));

        // A call on the shut-down channel fails at start with UNAVAILABLE.
        let (_late, late_closes) = start_call(&channel);
        wait_for(|| !late_closes.lock().is_empty()).await;
        assert_eq!(
            late_closes.lock()[0],
            format!("{}:Channel is shutdown", Code::Unavailable)
        );

        assert!(!channel.is_terminated());
        factory.transport(0).fire(|l| l.transport_terminated());
        assert!(channel.await_termination(Duration::from_secs(1)).await);
        assert!(channel.is_terminated() && channel.is_shutdown());
        assert!(*factory.closed.lock(), "factory released at termination");
    }

    #[tokio::test]
    async fn oob_transports_participate_in_termination() {
        let factory = Arc::new(ScriptedTransportFactory::new(vec![ConnectOutcome::Hang]));
        let channel = test_channel(factory.clone(), None);
        let (_call, _closes) = start_call(&channel);

        let group = EquivalentAddressGroup::single("127.0.0.1:2".parse().unwrap());
        let provider = channel.oob_provider_for_test(&group, "oob.example");
        provider.get();
        assert_eq!(factory.transport_count(), 2, "oob set connects on demand");

        channel.shutdown();
        factory.transport(0).fire(|l| l.transport_terminated());
        assert!(
            !channel.await_termination(Duration::from_millis(50)).await,
            "oob transport still live"
        );
        factory.transport(1).fire(|l| l.transport_terminated());
        assert!(channel.await_termination(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn connection_failure_triggers_resolver_refresh() {
        struct CountingResolverFactory {
            refreshes: Arc<AtomicUsize>,
        }

        struct CountingResolver {
            refreshes: Arc<AtomicUsize>,
            listener: Mutex<Option<Arc<dyn NameResolverListener>>>,
        }

        impl NameResolverFactory for CountingResolverFactory {
            fn new_name_resolver(
                &self,
                target: &Uri,
                _params: &Attributes,
            ) -> Option<Arc<dyn NameResolver>> {
                (target.scheme_str() == Some("static")).then(|| {
                    Arc::new(CountingResolver {
                        refreshes: self.refreshes.clone(),
                        listener: Mutex::new(None),
                    }) as Arc<dyn NameResolver>
                })
            }

            fn default_scheme(&self) -> &str {
                "static"
            }
        }

        impl NameResolver for CountingResolver {
            fn service_authority(&self) -> String {
                "counted".to_string()
            }

            fn start(&self, listener: Arc<dyn NameResolverListener>) {
                *self.listener.lock() = Some(listener.clone());
                listener.on_update(
                    vec![EquivalentAddressGroup::single("127.0.0.1:3".parse().unwrap())],
                    Attributes::new(),
                );
            }

            fn refresh(&self) {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
            }

            fn shutdown(&self) {}
        }

        let refreshes = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(ScriptedTransportFactory::new(vec![ConnectOutcome::Fail]));
        let channel = ManagedChannel::builder("static:///counted")
            .name_resolver_factory(Arc::new(CountingResolverFactory {
                refreshes: refreshes.clone(),
            }))
            .transport_factory(factory)
            .build()
            .unwrap();
        let (_call, _closes) = start_call(&channel);
        // The single address failed its pass, so the set asked for a refresh.
        wait_for(|| refreshes.load(Ordering::SeqCst) >= 1).await;
    }

    #[test]
    fn target_parsing_accepts_both_uri_forms() {
        assert_eq!(
            parse_target("dns:///svc.example:443").unwrap().scheme_str(),
            Some("dns")
        );
        assert_eq!(
            parse_target("static://inproc").unwrap().scheme_str(),
            Some("static")
        );
        // A bare authority has no scheme and falls through to the default.
        assert_eq!(parse_target("localhost:8080").unwrap().scheme_str(), None);
    }

    #[tokio::test]
    async fn unknown_scheme_fails_channel_construction() {
        let factory = Arc::new(ScriptedTransportFactory::new(vec![]));
        let err = ManagedChannel::builder("bogus:///what")
            .name_resolver_factory(Arc::new(StaticResolverFactory::new(vec![])))
            .transport_factory(factory)
            .build()
            .err()
            .expect("no resolver for scheme");
        assert!(err
            .description()
            .unwrap()
            .contains("cannot find a name resolver"));
    }
}
