//! Subscriber registry and fan-out of inbound payloads.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::report::{Fault, Reporter};
use crate::types::Payload;

/// A subscriber callback. Identity is the `Arc` allocation: registering clones
/// of the same `Arc` twice yields a single registration.
pub type Handler = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Stable identifier of one registration, used in fault reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

#[derive(Clone)]
struct Entry {
    id: SubscriberId,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
    history: Option<Vec<Payload>>,
}

/// Fans each payload out to every registered handler, in registration order.
///
/// Handlers run with no lock held, against a snapshot of the registry taken
/// when the dispatch pass starts. A handler may therefore subscribe or
/// unsubscribe (itself or others) while running; the change takes effect from
/// the next dispatch pass.
pub struct Dispatcher {
    registry: Mutex<Registry>,
    reporter: Arc<dyn Reporter>,
}

impl Dispatcher {
    /// `keep_history` enables the inbound log returned by [`history`](Self::history).
    pub fn new(reporter: Arc<dyn Reporter>, keep_history: bool) -> Self {
        Self {
            registry: Mutex::new(Registry {
                history: keep_history.then(Vec::new),
                ..Registry::default()
            }),
            reporter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` unless the same `Arc` is already registered.
    ///
    /// The returned [`Unsubscribe`] removes that registration.
    pub fn register(self: &Arc<Self>, handler: Handler) -> Unsubscribe {
        let mut registry = self.lock();
        let existing = registry
            .entries
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.handler, &handler))
            .map(|entry| entry.id);
        let id = match existing {
            Some(id) => id,
            None => {
                registry.next_id += 1;
                let id = SubscriberId(registry.next_id);
                registry.entries.push(Entry { id, handler });
                tracing::debug!(%id, total = registry.entries.len(), "Subscriber registered");
                id
            }
        };
        Unsubscribe {
            dispatcher: Arc::downgrade(self),
            id,
        }
    }

    fn remove(&self, id: SubscriberId) {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        if registry.entries.len() != before {
            tracing::debug!(%id, total = registry.entries.len(), "Subscriber removed");
        }
    }

    /// Deliver `payload` to every handler registered when the call starts.
    ///
    /// A panicking handler is reported and skipped; the rest still run.
    pub fn dispatch(&self, payload: &Payload) {
        let snapshot = {
            let mut registry = self.lock();
            if let Some(history) = registry.history.as_mut() {
                history.push(payload.clone());
            }
            registry.entries.clone()
        };

        for entry in snapshot {
            let handler = &entry.handler;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                self.reporter.report(&Fault::HandlerPanicked {
                    subscriber: entry.id,
                    message: panic_message(panic.as_ref()),
                });
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Every payload dispatched so far, in arrival order. Empty unless history
    /// was enabled.
    pub fn history(&self) -> Vec<Payload> {
        self.lock().history.clone().unwrap_or_default()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Capability that removes one registration. Calling it more than once is a
/// no-op. Dropping it leaves the handler registered.
#[derive(Clone)]
pub struct Unsubscribe {
    dispatcher: Weak<Dispatcher>,
    id: SubscriberId,
}

impl Unsubscribe {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn unsubscribe(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(self.id);
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").field("id", &self.id).finish()
    }
}
