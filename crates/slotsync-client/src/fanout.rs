use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

pub type Callback<A> = Arc<dyn Fn(&A) -> anyhow::Result<()> + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Registration token returned by `add`; pass it back to `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub invoked: usize,
    pub failed: usize,
}

/// Ordered callback list. Invocation order is registration order.
pub struct HandlerList<A: ?Sized> {
    entries: Vec<(HandlerId, Callback<A>)>,
}

impl<A: ?Sized> Default for HandlerList<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<A: ?Sized> HandlerList<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, callback: Callback<A>) -> HandlerId {
        let id = HandlerId::next();
        self.entries.push((id, callback));
        id
    }

    /// Unknown ids are ignored.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cloned so callers can invoke without holding their lock.
    pub fn snapshot(&self) -> Vec<(HandlerId, Callback<A>)> {
        self.entries.clone()
    }

    pub fn invoke(&self, arg: &A, label: &str) -> FanoutReport {
        invoke_all(&self.entries, arg, label)
    }
}

/// Runs every callback even when earlier ones fail. Errors and panics are
/// logged and counted, never propagated.
pub fn invoke_all<A: ?Sized>(
    callbacks: &[(HandlerId, Callback<A>)],
    arg: &A,
    label: &str,
) -> FanoutReport {
    let mut report = FanoutReport::default();
    for (id, callback) in callbacks {
        report.invoked += 1;
        match catch_unwind(AssertUnwindSafe(|| callback(arg))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                report.failed += 1;
                warn!(event = "handler_failed", label = label, handler = id.0, error = %err);
            }
            Err(panic) => {
                report.failed += 1;
                warn!(
                    event = "handler_panicked",
                    label = label,
                    handler = id.0,
                    message = %panic_message(panic.as_ref())
                );
            }
        }
    }
    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
