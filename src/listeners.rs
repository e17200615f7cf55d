//! Ordered listener registries keyed by subscription handle.
//!
//! Registration returns a [`Subscription`]; removal consumes that handle, so
//! callers never need to keep the original closure around. Invocation order is
//! insertion order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Which registry a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Message,
    Connect,
    Disconnect,
    Error,
}

/// Opaque handle returned by every `on_*` registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: ListenerKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> ListenerKind {
        self.kind
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// One ordered list of callbacks taking `&T`.
pub struct Registry<T: ?Sized> {
    kind: ListenerKind,
    entries: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: ListenerKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: u64, f: Callback<T>) -> Subscription {
        if let Ok(mut guard) = self.entries.lock() {
            guard.push((id, f));
        }
        Subscription { kind: self.kind, id }
    }

    fn remove(&self, id: u64) -> bool {
        let Ok(mut guard) = self.entries.lock() else {
            return false;
        };
        match guard.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(pos) => {
                guard.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Invoke every callback registered at the time of the call.
    ///
    /// The list is snapshotted first and the lock released, so callbacks may
    /// register, unregister or send without deadlocking.
    pub fn dispatch(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = match self.entries.lock() {
            Ok(guard) => guard.iter().map(|(_, f)| Arc::clone(f)).collect(),
            Err(_) => return,
        };
        for f in snapshot {
            f(value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The four registries of a connection manager, sharing one id space.
pub struct Listeners<M: ?Sized, E: ?Sized> {
    next_id: AtomicU64,
    pub message: Registry<M>,
    pub connect: Registry<()>,
    pub disconnect: Registry<()>,
    pub error: Registry<E>,
}

impl<M: ?Sized, E: ?Sized> Listeners<M, E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            message: Registry::new(ListenerKind::Message),
            connect: Registry::new(ListenerKind::Connect),
            disconnect: Registry::new(ListenerKind::Disconnect),
            error: Registry::new(ListenerKind::Error),
        }
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn on_message(&self, f: impl Fn(&M) + Send + Sync + 'static) -> Subscription {
        self.message.add(self.next(), Arc::new(f))
    }

    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.connect.add(self.next(), Arc::new(move |_: &()| f()))
    }

    pub fn on_disconnect(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.disconnect.add(self.next(), Arc::new(move |_: &()| f()))
    }

    pub fn on_error(&self, f: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        self.error.add(self.next(), Arc::new(f))
    }

    /// Remove one subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        match sub.kind {
            ListenerKind::Message => self.message.remove(sub.id),
            ListenerKind::Connect => self.connect.remove(sub.id),
            ListenerKind::Disconnect => self.disconnect.remove(sub.id),
            ListenerKind::Error => self.error.remove(sub.id),
        }
    }

    /// Total number of live subscriptions across all registries.
    pub fn count(&self) -> usize {
        self.message.len() + self.connect.len() + self.disconnect.len() + self.error.len()
    }
}

impl<M: ?Sized, E: ?Sized> Default for Listeners<M, E> {
    fn default() -> Self {
        Self::new()
    }
}
