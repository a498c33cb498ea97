//! Per-call options and typed attribute bags.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::Deadline;

/// A typed attribute key, compared by identity. Keep keys in `static`s.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> AttributeKey<T> {
        AttributeKey {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An immutable typed key/value bag, used for balancer affinity and
/// name-resolution parameters.
#[derive(Clone, Default)]
pub struct Attributes {
    entries: Vec<(usize, Arc<dyn Any + Send + Sync>)>,
}

impl Attributes {
    pub fn new() -> Attributes {
        Attributes::default()
    }

    pub fn with<T: Send + Sync + 'static>(
        mut self,
        key: &'static AttributeKey<T>,
        value: T,
    ) -> Attributes {
        let id = key as *const AttributeKey<T> as usize;
        self.entries.retain(|(k, _)| *k != id);
        self.entries.push((id, Arc::new(value)));
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &'static AttributeKey<T>) -> Option<Arc<T>> {
        let id = key as *const AttributeKey<T> as usize;
        self.entries
            .iter()
            .find(|(k, _)| *k == id)
            .and_then(|(_, v)| v.clone().downcast::<T>().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Attributes({} entries)", self.entries.len())
    }
}

/// A typed call-option key carrying its default value.
pub struct CallOptionKey<T> {
    name: &'static str,
    default: T,
}

impl<T: Clone + Send + Sync + 'static> CallOptionKey<T> {
    pub const fn new(name: &'static str, default: T) -> CallOptionKey<T> {
        CallOptionKey { name, default }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }
}

/// The immutable options bundle for one call. Every `with_*` returns a copy
/// with one field replaced.
#[derive(Clone, Default)]
pub struct CallOptions {
    deadline: Option<Deadline>,
    authority: Option<String>,
    compressor: Option<String>,
    wait_for_ready: bool,
    affinity: Attributes,
    executor: Option<tokio::runtime::Handle>,
    custom: Vec<(usize, Arc<dyn Any + Send + Sync>)>,
}

impl CallOptions {
    pub fn new() -> CallOptions {
        CallOptions::default()
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> CallOptions {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_deadline_after(self, duration: Duration) -> CallOptions {
        self.with_deadline(Deadline::after(duration))
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// Overrides the `:authority` used for the call.
    pub fn with_authority(mut self, authority: impl Into<String>) -> CallOptions {
        self.authority = Some(authority.into());
        self
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn with_compression(mut self, compressor: impl Into<String>) -> CallOptions {
        self.compressor = Some(compressor.into());
        self
    }

    pub fn compressor(&self) -> Option<&str> {
        self.compressor.as_deref()
    }

    /// Waits for a ready transport instead of failing fast on transient
    /// transport errors.
    pub fn with_wait_for_ready(mut self) -> CallOptions {
        self.wait_for_ready = true;
        self
    }

    pub fn without_wait_for_ready(mut self) -> CallOptions {
        self.wait_for_ready = false;
        self
    }

    pub fn is_wait_for_ready(&self) -> bool {
        self.wait_for_ready
    }

    pub fn with_affinity(mut self, affinity: Attributes) -> CallOptions {
        self.affinity = affinity;
        self
    }

    pub fn affinity(&self) -> &Attributes {
        &self.affinity
    }

    /// Runtime handle on which the call's listener callbacks are dispatched;
    /// defaults to the channel's.
    pub fn with_executor(mut self, executor: tokio::runtime::Handle) -> CallOptions {
        self.executor = Some(executor);
        self
    }

    pub fn executor(&self) -> Option<&tokio::runtime::Handle> {
        self.executor.as_ref()
    }

    pub fn with_option<T: Clone + Send + Sync + 'static>(
        mut self,
        key: &'static CallOptionKey<T>,
        value: T,
    ) -> CallOptions {
        let id = key as *const CallOptionKey<T> as usize;
        self.custom.retain(|(k, _)| *k != id);
        self.custom.push((id, Arc::new(value)));
        self
    }

    /// Reads a typed option, falling back to the key's default.
    pub fn option<T: Clone + Send + Sync + 'static>(&self, key: &'static CallOptionKey<T>) -> T {
        let id = key as *const CallOptionKey<T> as usize;
        self.custom
            .iter()
            .find(|(k, _)| *k == id)
            .and_then(|(_, v)| v.clone().downcast::<T>().ok())
            .map(|v| (*v).clone())
            .unwrap_or_else(|| key.default_value().clone())
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("deadline", &self.deadline)
            .field("authority", &self.authority)
            .field("compressor", &self.compressor)
            .field("wait_for_ready", &self.wait_for_ready)
            .finish_non_exhaustive()
    }
}
