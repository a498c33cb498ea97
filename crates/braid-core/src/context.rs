//! A tree of cancellation scopes carrying typed values and deadlines.
//!
//! A [`Context`] is an immutable layer over its parent: each `with_*` call
//! produces a child that inherits the parent's values, deadline and
//! cancellation. Cancelling a scope cancels every scope below it; the first
//! cancellation wins and records its [`Status`] as the cause.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{Code, Deadline, Status};

/// A typed context key. Keys are compared by identity, so they should live in
/// `static`s.
pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Key<T> {
        Key {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn key_id<T>(key: &'static Key<T>) -> usize {
    key as *const Key<T> as usize
}

type Listener = Box<dyn FnOnce(&Status) + Send>;

#[derive(Default)]
struct CancelCell {
    state: Mutex<CellState>,
}

#[derive(Default)]
struct CellState {
    cause: Option<Status>,
    listeners: Vec<Listener>,
    children: Vec<Weak<CancelCell>>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl CancelCell {
    /// First cancellation wins; descendants are cancelled with the same cause.
    fn cancel(self: &Arc<Self>, status: Status) -> bool {
        let (listeners, children, timer) = {
            let mut state = self.state.lock();
            if state.cause.is_some() {
                return false;
            }
            state.cause = Some(status.clone());
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.children),
                state.timer.take(),
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        for listener in listeners {
            listener(&status);
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(status.clone());
            }
        }
        true
    }
}

struct Inner {
    parent: Option<Context>,
    /// Effective deadline at this layer (already min'ed with the parent's).
    deadline: Option<Deadline>,
    value: Option<(usize, Arc<dyn Any + Send + Sync>)>,
    /// Nearest enclosing cancellation scope.
    cancel: Option<Arc<CancelCell>>,
}

static ROOT: Lazy<Context> = Lazy::new(|| Context {
    inner: Arc::new(Inner {
        parent: None,
        deadline: None,
        value: None,
        cancel: None,
    }),
});

thread_local! {
    static ATTACHED: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

/// A context layer. Cheap to clone; all clones share the same scope.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// The root context: never cancelled, no deadline, no values.
    pub fn root() -> Context {
        ROOT.clone()
    }

    /// The context attached to the current thread, or the root.
    pub fn current() -> Context {
        ATTACHED
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(Context::root)
    }

    /// Attaches this context to the current thread until the guard drops.
    pub fn attach(&self) -> ContextGuard {
        ATTACHED.with(|stack| stack.borrow_mut().push(self.clone()));
        ContextGuard {
            _not_send: PhantomData,
        }
    }

    /// A child carrying one typed value.
    pub fn with_value<T: Send + Sync + 'static>(
        &self,
        key: &'static Key<T>,
        value: T,
    ) -> Context {
        Context {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                deadline: self.inner.deadline,
                value: Some((key_id(key), Arc::new(value))),
                cancel: self.inner.cancel.clone(),
            }),
        }
    }

    /// Looks a value up through this layer and its ancestors.
    pub fn value<T: Send + Sync + 'static>(&self, key: &'static Key<T>) -> Option<Arc<T>> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some((id, value)) = &ctx.inner.value {
                if *id == key_id(key) {
                    return value.clone().downcast::<T>().ok();
                }
            }
            current = ctx.inner.parent.as_ref();
        }
        None
    }

    /// A cancellable child scope.
    pub fn with_cancellation(&self) -> CancellableContext {
        let cell = Arc::new(CancelCell::default());
        self.adopt(&cell);
        let context = Context {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                deadline: self.inner.deadline,
                value: None,
                cancel: Some(cell.clone()),
            }),
        };
        CancellableContext { context, cell }
    }

    /// A cancellable child that cancels itself with DEADLINE_EXCEEDED when the
    /// deadline expires. A deadline later than an inherited one is clamped to
    /// the inherited one.
    pub fn with_deadline(
        &self,
        deadline: Deadline,
        timer: &tokio::runtime::Handle,
    ) -> CancellableContext {
        let deadline = match self.inner.deadline {
            Some(inherited) => inherited.min(deadline),
            None => deadline,
        };
        let cell = Arc::new(CancelCell::default());
        self.adopt(&cell);
        let timer_cell = cell.clone();
        let task = timer.spawn(async move {
            tokio::time::sleep_until(deadline.expiration()).await;
            tracing::debug!("context deadline expired");
            timer_cell.cancel(
                Status::new(Code::DeadlineExceeded).with_description("context deadline exceeded"),
            );
        });
        {
            let mut state = cell.state.lock();
            if state.cause.is_some() {
                task.abort();
            } else {
                state.timer = Some(task);
            }
        }
        let context = Context {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                deadline: Some(deadline),
                value: None,
                cancel: Some(cell.clone()),
            }),
        };
        CancellableContext { context, cell }
    }

    /// A child that inherits values but not cancellation or deadline.
    pub fn fork(&self) -> Context {
        Context {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                deadline: None,
                value: None,
                cancel: None,
            }),
        }
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.inner.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_cause().is_some()
    }

    /// The status the nearest enclosing scope was cancelled with, if any.
    pub fn cancellation_cause(&self) -> Option<Status> {
        self.inner
            .cancel
            .as_ref()
            .and_then(|cell| cell.state.lock().cause.clone())
    }

    /// Runs `listener` when the nearest enclosing scope is cancelled;
    /// immediately if it already was. On a non-cancellable context the
    /// listener is never invoked.
    pub fn add_listener(&self, listener: impl FnOnce(&Status) + Send + 'static) {
        let Some(cell) = &self.inner.cancel else {
            return;
        };
        let mut listener: Option<Listener> = Some(Box::new(listener));
        let fire_now = {
            let mut state = cell.state.lock();
            match &state.cause {
                Some(cause) => Some(cause.clone()),
                None => {
                    state.listeners.push(listener.take().expect("unused"));
                    None
                }
            }
        };
        if let Some(cause) = fire_now {
            (listener.take().expect("not pushed"))(&cause);
        }
    }

    /// Registers `cell` under the nearest enclosing scope so parental
    /// cancellation propagates down.
    fn adopt(&self, cell: &Arc<CancelCell>) {
        let Some(parent) = &self.inner.cancel else {
            return;
        };
        let already_cancelled = {
            let mut state = parent.state.lock();
            match &state.cause {
                Some(cause) => Some(cause.clone()),
                None => {
                    state.children.push(Arc::downgrade(cell));
                    None
                }
            }
        };
        if let Some(cause) = already_cancelled {
            cell.cancel(cause);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A context plus the right to cancel it.
pub struct CancellableContext {
    context: Context,
    cell: Arc<CancelCell>,
}

impl CancellableContext {
    /// Cancels this scope and all descendants. Returns false if some earlier
    /// cancellation already won.
    pub fn cancel(&self, status: Status) -> bool {
        self.cell.cancel(status)
    }

    pub fn context(&self) -> Context {
        self.context.clone()
    }
}

impl std::ops::Deref for CancellableContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

/// Detaches the context from the thread when dropped.
pub struct ContextGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        ATTACHED.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
