//! Serialized callback execution and shared runtime resources.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

/// Runs submitted jobs one at a time, in submission order, on a single
/// drainer task. Used to give each call a linear sequence of listener
/// callbacks regardless of which thread produced them.
#[derive(Clone)]
pub struct SerialExecutor {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    pub fn new(handle: &Handle) -> SerialExecutor {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        SerialExecutor { tx }
    }

    /// Enqueues a job. Jobs submitted from the same thread run in submission
    /// order. Dropped silently once the runtime is gone.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }
}

/// A resource that can be shared between channels and servers under
/// reference counting.
pub trait SharedResource: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    fn create(&self) -> Self::Output;
    fn close(&self, instance: Self::Output);
}

/// Checks a shared resource in and out. The instance is created on first
/// `get` and closed when the last user releases it.
pub struct SharedResourceHolder<R: SharedResource> {
    resource: R,
    state: Mutex<Option<(R::Output, usize)>>,
}

impl<R: SharedResource> SharedResourceHolder<R> {
    pub fn new(resource: R) -> SharedResourceHolder<R> {
        SharedResourceHolder {
            resource,
            state: Mutex::new(None),
        }
    }

    pub fn get(&self) -> R::Output {
        let mut state = self.state.lock();
        let (instance, count) = match state.take() {
            Some((instance, count)) => (instance, count + 1),
            None => (self.resource.create(), 1),
        };
        *state = Some((instance.clone(), count));
        instance
    }

    pub fn release(&self) {
        let closing = {
            let mut state = self.state.lock();
            match state.take() {
                Some((instance, count)) if count > 1 => {
                    *state = Some((instance, count - 1));
                    None
                }
                Some((instance, _)) => Some(instance),
                None => None,
            }
        };
        if let Some(instance) = closing {
            self.resource.close(instance);
        }
    }
}

/// The shared callback executor: hands out the runtime handle channels and
/// servers dispatch listener callbacks on when the application supplies none.
pub struct CallbackExecutor;

impl SharedResource for CallbackExecutor {
    type Output = Handle;

    fn create(&self) -> Handle {
        Handle::current()
    }

    fn close(&self, _instance: Handle) {}
}

/// Process-wide holder for the default callback executor.
pub fn shared_callback_executor() -> &'static SharedResourceHolder<CallbackExecutor> {
    static HOLDER: Lazy<SharedResourceHolder<CallbackExecutor>> =
        Lazy::new(|| SharedResourceHolder::new(CallbackExecutor));
    &HOLDER
}
