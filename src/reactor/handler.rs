//! Handler Capability Set
//!
//! A handler owns endpoints and a state machine. The reactor only ever sees
//! it through [`Handler`]; concrete handlers (socket-facing, per-peer relay,
//! shell) are independent types composed from the same building blocks.
//!
//! The reactor wraps every handler in a [`HandlerCell`]. The cell's
//! in-flight flag is the single-flight guard: it is raised by the reactor
//! before a task is queued and cleared by the worker after
//! `post_processing`, and the reactor never dispatches a handler whose flag
//! is raised.
//!
//! A panic inside `process` or `post_processing` is caught by the cell. The
//! in-flight flag is still cleared, the worker survives, and the handler is
//! marked failed so the reactor prunes it on its next turn.

use crate::reactor::endpoint::{EndpointId, Role, Subscription};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::error;

/// The capability set the reactor and the workers rely on.
pub trait Handler: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Runs the state machine for one readiness event until idle.
    fn process(&mut self, role: Role, endpoint: EndpointId);

    /// Called on the reactor thread right before the task is queued.
    fn pre_processing(&mut self) {}

    /// Called on the worker thread right after `process`.
    fn post_processing(&mut self) {}

    /// Every endpoint the handler owns, flagged with whether it currently
    /// wants readability events.
    fn endpoints(&self) -> Vec<Subscription>;

    /// False once the handler has finished and may be pruned.
    fn is_running(&self) -> bool;
}

/// Reactor-assigned handler identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) usize);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h#{}", self.0)
    }
}

/// A handler plus its single-flight flag.
pub struct HandlerCell {
    id: HandlerId,
    name: String,
    handler: Mutex<Box<dyn Handler>>,
    in_flight: AtomicBool,
    failed: AtomicBool,
}

impl HandlerCell {
    pub fn new(id: HandlerId, handler: Box<dyn Handler>) -> Self {
        Self {
            id,
            name: handler.name().to_string(),
            handler: Mutex::new(handler),
            in_flight: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Marks the handler in flight. Returns false if it already was.
    pub fn begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True once the handler has panicked.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Clears the in-flight mark.
    pub fn finish(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Handler>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one dispatched event: `process` then `post_processing`, then
    /// clears the in-flight mark. Returns false if the handler panicked.
    pub fn run(&self, role: Role, endpoint: EndpointId) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut handler = self.lock();
            handler.process(role, endpoint);
            handler.post_processing();
        }));

        let completed = outcome.is_ok();
        if !completed {
            error!(handler = %self.id, name = %self.name, role = %role, "Handler panicked; it will be pruned");
            self.failed.store(true, Ordering::Release);
        }
        self.finish();
        completed
    }
}

impl fmt::Debug for HandlerCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("in_flight", &self.is_in_flight())
            .field("failed", &self.has_failed())
            .finish()
    }
}
