//! Load-balancer and name-resolver interfaces, with the stock
//! implementations: a pick-first balancer, a DNS resolver and a static
//! resolver for in-process wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use http::Uri;
use parking_lot::Mutex;

use braid_core::{Attributes, Status};

use crate::delayed::DelayedClientTransport;
use crate::transport::ClientTransport;

/// An ordered set of socket addresses treated as one logical backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EquivalentAddressGroup {
    addresses: Vec<SocketAddr>,
}

impl EquivalentAddressGroup {
    pub fn new(addresses: Vec<SocketAddr>) -> EquivalentAddressGroup {
        EquivalentAddressGroup { addresses }
    }

    pub fn single(address: SocketAddr) -> EquivalentAddressGroup {
        EquivalentAddressGroup {
            addresses: vec![address],
        }
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Receives resolution results.
pub trait NameResolverListener: Send + Sync {
    fn on_update(&self, groups: Vec<EquivalentAddressGroup>, config: Attributes);
    fn on_error(&self, error: Status);
}

/// Resolves a service name to address groups.
pub trait NameResolver: Send + Sync {
    /// The authority calls against this target use.
    fn service_authority(&self) -> String;
    fn start(&self, listener: Arc<dyn NameResolverListener>);
    /// Re-resolves; typically prompted by connection failures.
    fn refresh(&self);
    fn shutdown(&self);
}

/// Creates resolvers for targets whose scheme it understands.
pub trait NameResolverFactory: Send + Sync {
    /// `None` when this factory does not handle the target's scheme.
    fn new_name_resolver(&self, target: &Uri, params: &Attributes) -> Option<Arc<dyn NameResolver>>;
    /// Scheme assumed when the target string is a bare authority.
    fn default_scheme(&self) -> &str;
}

/// Picks transports for calls and absorbs resolution updates.
pub trait LoadBalancer: Send + Sync {
    fn pick_transport(&self, affinity: &Attributes) -> Arc<dyn ClientTransport>;
    fn handle_resolved_addresses(&self, groups: Vec<EquivalentAddressGroup>, config: Attributes);
    fn handle_name_resolution_error(&self, error: Status);
    fn shutdown(&self);
}

pub trait LoadBalancerFactory: Send + Sync {
    fn new_load_balancer(
        &self,
        service_authority: &str,
        manager: Arc<dyn TransportManager>,
    ) -> Arc<dyn LoadBalancer>;
}

/// What the channel offers a balancer: transports by address group plus
/// synthetic transports for error, buffering and out-of-band cases.
pub trait TransportManager: Send + Sync {
    fn get_transport(&self, group: &EquivalentAddressGroup) -> Arc<dyn ClientTransport>;
    fn create_failing_transport(&self, error: Status) -> Arc<dyn ClientTransport>;
    fn create_interim_transport(&self) -> Arc<InterimTransport>;
    /// A transport source outside the channel's address-group map, for
    /// balancers that talk to their own control-plane backends.
    fn create_oob_transport_provider(
        &self,
        group: &EquivalentAddressGroup,
        authority: &str,
    ) -> Arc<crate::channel::OobTransportProvider>;
}

/// A channel-registered delayed transport a balancer parks picks on until it
/// knows real addresses.
pub struct InterimTransport {
    delayed: Arc<DelayedClientTransport>,
}

impl InterimTransport {
    pub(crate) fn new(delayed: Arc<DelayedClientTransport>) -> Arc<InterimTransport> {
        Arc::new(InterimTransport { delayed })
    }

    pub fn transport(&self) -> Arc<dyn ClientTransport> {
        self.delayed.clone()
    }

    /// Drains parked picks against real transports and retires the interim.
    pub fn close_with_real_transports(
        &self,
        supplier: impl Fn() -> Arc<dyn ClientTransport> + Send + Sync + 'static,
    ) {
        self.delayed.set_transport_supplier(supplier);
        self.delayed.shutdown();
    }

    /// Fails parked picks.
    pub fn close_with_error(&self, error: Status) {
        self.delayed.shutdown_now(error);
    }
}

/// Pick-first balancing: every call goes to the first address group from the
/// most recent resolution. Picks made before the first resolution are parked
/// on an interim transport.
pub struct PickFirstBalancerFactory;

impl LoadBalancerFactory for PickFirstBalancerFactory {
    fn new_load_balancer(
        &self,
        _service_authority: &str,
        manager: Arc<dyn TransportManager>,
    ) -> Arc<dyn LoadBalancer> {
        Arc::new(PickFirstBalancer {
            manager,
            state: Mutex::new(PickFirstState::default()),
        })
    }
}

#[derive(Default)]
struct PickFirstState {
    addresses: Option<EquivalentAddressGroup>,
    interim: Option<Arc<InterimTransport>>,
    resolution_error: Option<Status>,
    closed: bool,
}

struct PickFirstBalancer {
    manager: Arc<dyn TransportManager>,
    state: Mutex<PickFirstState>,
}

impl LoadBalancer for PickFirstBalancer {
    fn pick_transport(&self, _affinity: &Attributes) -> Arc<dyn ClientTransport> {
        enum Pick {
            Group(EquivalentAddressGroup),
            Error(Status),
            Interim(Arc<InterimTransport>),
        }
        let pick = {
            let mut state = self.state.lock();
            if state.closed {
                Pick::Error(Status::unavailable("load balancer has shut down"))
            } else if let Some(group) = &state.addresses {
                Pick::Group(group.clone())
            } else if let Some(error) = &state.resolution_error {
                Pick::Error(error.clone())
            } else {
                match &state.interim {
                    Some(interim) => Pick::Interim(interim.clone()),
                    None => {
                        let interim = self.manager.create_interim_transport();
                        state.interim = Some(interim.clone());
                        Pick::Interim(interim)
                    }
                }
            }
        };
        match pick {
            Pick::Group(group) => self.manager.get_transport(&group),
            Pick::Error(error) => self.manager.create_failing_transport(error),
            Pick::Interim(interim) => interim.transport(),
        }
    }

    fn handle_resolved_addresses(&self, groups: Vec<EquivalentAddressGroup>, _config: Attributes) {
        let flattened: Vec<SocketAddr> = groups
            .iter()
            .flat_map(|g| g.addresses().iter().copied())
            .collect();
        if flattened.is_empty() {
            self.handle_name_resolution_error(Status::unavailable(
                "name resolver returned an empty list",
            ));
            return;
        }
        let group = EquivalentAddressGroup::new(flattened);
        let interim = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.addresses = Some(group.clone());
            state.resolution_error = None;
            state.interim.take()
        };
        if let Some(interim) = interim {
            let manager = self.manager.clone();
            interim.close_with_real_transports(move || manager.get_transport(&group));
        }
    }

    fn handle_name_resolution_error(&self, error: Status) {
        let error = if error.is_ok() {
            Status::unavailable("name resolution failed")
        } else {
            error
        };
        let interim = {
            let mut state = self.state.lock();
            if state.closed || state.addresses.is_some() {
                return;
            }
            state.resolution_error = Some(error.clone());
            state.interim.take()
        };
        if let Some(interim) = interim {
            interim.close_with_error(error);
        }
    }

    fn shutdown(&self) {
        let interim = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.interim.take()
        };
        if let Some(interim) = interim {
            interim.close_with_error(Status::unavailable("load balancer has shut down"));
        }
    }
}

/// Extracts the name part of a target URI: its authority, or the path with
/// the leading `/` stripped for `scheme:///name` forms.
fn target_name(target: &Uri) -> Option<String> {
    if let Some(authority) = target.authority() {
        if !authority.as_str().is_empty() {
            return Some(authority.as_str().to_string());
        }
    }
    let path = target.path().trim_start_matches('/');
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// Resolves `dns` targets with the runtime's host lookup. The name must be
/// `host:port`; a bare host gets the plaintext default port 80.
pub struct DnsResolverFactory;

impl NameResolverFactory for DnsResolverFactory {
    fn new_name_resolver(
        &self,
        target: &Uri,
        _params: &Attributes,
    ) -> Option<Arc<dyn NameResolver>> {
        if target.scheme_str() != Some("dns") {
            return None;
        }
        let name = target_name(target)?;
        Some(Arc::new(DnsResolver {
            name,
            state: Mutex::new(DnsResolverState {
                listener: None,
                shutdown: false,
            }),
        }))
    }

    fn default_scheme(&self) -> &str {
        "dns"
    }
}

struct DnsResolverState {
    listener: Option<Arc<dyn NameResolverListener>>,
    shutdown: bool,
}

struct DnsResolver {
    name: String,
    state: Mutex<DnsResolverState>,
}

impl DnsResolver {
    fn resolve(&self) {
        let listener = {
            let state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.listener.clone()
        };
        let Some(listener) = listener else {
            return;
        };
        let host_port = if self.name.contains(':') {
            self.name.clone()
        } else {
            format!("{}:80", self.name)
        };
        tokio::spawn(async move {
            match tokio::net::lookup_host(&host_port).await {
                Ok(addresses) => {
                    let addresses: Vec<SocketAddr> = addresses.collect();
                    if addresses.is_empty() {
                        listener.on_error(Status::unavailable(format!(
                            "no addresses for {}",
                            host_port
                        )));
                    } else {
                        listener
                            .on_update(vec![EquivalentAddressGroup::new(addresses)], Attributes::new());
                    }
                }
                Err(error) => {
                    listener.on_error(
                        Status::unavailable(format!("DNS resolution failed for {}", host_port))
                            .with_cause(Arc::new(error)),
                    );
                }
            }
        });
    }
}

impl NameResolver for DnsResolver {
    fn service_authority(&self) -> String {
        self.name.clone()
    }

    fn start(&self, listener: Arc<dyn NameResolverListener>) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.listener.is_none(), "started twice");
            state.listener = Some(listener);
        }
        self.resolve();
    }

    fn refresh(&self) {
        self.resolve();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.listener = None;
    }
}

/// Resolves `static` targets to a fixed address list; the workhorse of tests
/// and in-process transports.
pub struct StaticResolverFactory {
    addresses: Vec<SocketAddr>,
}

impl StaticResolverFactory {
    pub fn new(addresses: Vec<SocketAddr>) -> StaticResolverFactory {
        StaticResolverFactory { addresses }
    }
}

impl NameResolverFactory for StaticResolverFactory {
    fn new_name_resolver(
        &self,
        target: &Uri,
        _params: &Attributes,
    ) -> Option<Arc<dyn NameResolver>> {
        if target.scheme_str() != Some("static") {
            return None;
        }
        let authority = target_name(target)?;
        Some(Arc::new(StaticResolver {
            authority,
            addresses: self.addresses.clone(),
            state: Mutex::new(None),
        }))
    }

    fn default_scheme(&self) -> &str {
        "static"
    }
}

struct StaticResolver {
    authority: String,
    addresses: Vec<SocketAddr>,
    state: Mutex<Option<Arc<dyn NameResolverListener>>>,
}

impl NameResolver for StaticResolver {
    fn service_authority(&self) -> String {
        self.authority.clone()
    }

    fn start(&self, listener: Arc<dyn NameResolverListener>) {
        *self.state.lock() = Some(listener.clone());
        listener.on_update(
            vec![EquivalentAddressGroup::new(self.addresses.clone())],
            Attributes::new(),
        );
    }

    fn refresh(&self) {
        let listener = self.state.lock().clone();
        if let Some(listener) = listener {
            listener.on_update(
                vec![EquivalentAddressGroup::new(self.addresses.clone())],
                Attributes::new(),
            );
        }
    }

    fn shutdown(&self) {
        *self.state.lock() = None;
    }
}
