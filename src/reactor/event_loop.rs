//! The Reactor
//!
//! A single thread owns the `mio::Poll` and decides which handler runs next.
//! Each turn of the loop:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ 0. admit queued handlers, prune finished ones, check running   │
//! │ 1. refresh subscriptions of every idle handler                 │
//! │ 2. poll with a bounded timeout (only if nothing is pending)    │
//! │ 3. take exactly one ready endpoint                             │
//! │ 4. resolve its handler, withdraw the handler's subscriptions,  │
//! │    queue a task on the dispatch pool                           │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Single-flight
//!
//! While a handler is in flight none of its endpoints are registered, so the
//! poll cannot report them and stale ready entries for it are dropped. When
//! the worker finishes it clears the flag and wakes the poll; the next
//! refresh registers the endpoints again. Registering a descriptor that is
//! already readable reports it on the next poll, so data left behind by the
//! previous run is never missed.

use crate::reactor::dispatch::{DispatchPool, DispatchStats, Task};
use crate::reactor::endpoint::{EndpointId, Role, Subscription, WAKER_TOKEN};
use crate::reactor::handler::{Handler, HandlerCell, HandlerId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Waker};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Default number of dispatch workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default upper bound on one poll wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Reactor settings.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of dispatch workers
    pub workers: usize,
    /// Upper bound on one poll wait, so maintenance still runs when idle
    pub poll_timeout: Duration,
    /// Capacity of the poll event buffer
    pub event_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            event_capacity: 256,
        }
    }
}

/// Errors that stop the reactor.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("reactor has shut down")]
    Closed,
}

/// A clonable handle for talking to a running reactor from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    admissions: Sender<Box<dyn Handler>>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Queues a new handler; it is registered on the reactor's next turn.
    pub fn admit(&self, handler: Box<dyn Handler>) -> Result<(), ReactorError> {
        self.admissions
            .send(handler)
            .map_err(|_| ReactorError::Closed)?;
        self.wake();
        Ok(())
    }

    /// Asks the reactor to stop after its current turn.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The shared flag the reactor checks each turn.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Interrupts a blocked poll.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

/// A registered handler and the endpoints currently registered for it.
struct Slot {
    cell: Arc<HandlerCell>,
    registered: HashMap<EndpointId, Subscription>,
}

/// Single-threaded readiness multiplexer.
pub struct Reactor {
    poll: Poll,
    events: Events,
    config: ReactorConfig,
    handle: ReactorHandle,
    admissions: Receiver<Box<dyn Handler>>,
    slots: HashMap<HandlerId, Slot>,
    /// Registration attachment: endpoint -> owning handler and role
    owners: HashMap<EndpointId, (HandlerId, Role)>,
    ready: VecDeque<EndpointId>,
    pool: DispatchPool,
    next_handler: usize,
}

impl Reactor {
    /// Creates a reactor and starts its dispatch pool.
    pub fn new(config: ReactorConfig) -> Result<Self, ReactorError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let pool = DispatchPool::new(config.workers, Some(Arc::clone(&waker)))?;
        let (tx, rx) = unbounded();

        let handle = ReactorHandle {
            admissions: tx,
            running: Arc::new(AtomicBool::new(true)),
            waker,
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity.max(1)),
            config,
            handle,
            admissions: rx,
            slots: HashMap::new(),
            owners: HashMap::new(),
            ready: VecDeque::new(),
            pool,
            next_handler: 0,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn dispatch_stats(&self) -> Arc<DispatchStats> {
        self.pool.stats()
    }

    /// Number of live handlers.
    pub fn handler_count(&self) -> usize {
        self.slots.len()
    }

    /// Adds a handler directly (from the reactor's own thread).
    pub fn register(&mut self, handler: Box<dyn Handler>) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;

        let cell = Arc::new(HandlerCell::new(id, handler));
        debug!(handler = %id, name = cell.name(), "Handler registered");

        self.slots.insert(
            id,
            Slot {
                cell,
                registered: HashMap::new(),
            },
        );
        id
    }

    /// Runs until the running flag turns false, then stops the workers.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        info!(
            handlers = self.slots.len(),
            workers = self.pool.size(),
            "Reactor started"
        );

        let result = loop {
            match self.turn() {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.shutdown();
        info!("Reactor stopped");
        result
    }

    /// Runs one turn of the loop. Returns false once the reactor should stop.
    pub fn turn(&mut self) -> Result<bool, ReactorError> {
        self.admit_pending();
        self.prune();

        if !self.handle.is_running() {
            return Ok(false);
        }

        self.refresh_subscriptions();
        self.wait()?;
        self.dispatch_one();
        Ok(true)
    }

    fn admit_pending(&mut self) {
        while let Ok(handler) = self.admissions.try_recv() {
            self.register(handler);
        }
    }

    /// Drops handlers that are done or have panicked, once not in flight.
    fn prune(&mut self) {
        let finished: Vec<HandlerId> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                !slot.cell.is_in_flight()
                    && (slot.cell.has_failed() || !slot.cell.lock().is_running())
            })
            .map(|(id, _)| *id)
            .collect();

        let registry = self.poll.registry();
        for id in finished {
            if let Some(mut slot) = self.slots.remove(&id) {
                for (endpoint, sub) in slot.registered.drain() {
                    deregister(registry, &sub);
                    self.owners.remove(&endpoint);
                }
                info!(handler = %id, name = slot.cell.name(), "Handler stopped");
            }
        }
    }

    /// Makes registrations match what each idle handler wants.
    fn refresh_subscriptions(&mut self) {
        let registry = self.poll.registry();
        let mut additions: Vec<(HandlerId, Subscription)> = Vec::new();

        for (id, slot) in self.slots.iter_mut() {
            if slot.cell.is_in_flight() {
                continue;
            }

            let wanted: HashMap<EndpointId, Subscription> = slot
                .cell
                .lock()
                .endpoints()
                .into_iter()
                .filter(|sub| sub.wanted)
                .map(|sub| (sub.id, sub))
                .collect();

            let stale: Vec<EndpointId> = slot
                .registered
                .iter()
                .filter(|(endpoint, sub)| wanted.get(endpoint).map_or(true, |w| w.fd != sub.fd))
                .map(|(endpoint, _)| *endpoint)
                .collect();

            for endpoint in stale {
                if let Some(sub) = slot.registered.remove(&endpoint) {
                    deregister(registry, &sub);
                    self.owners.remove(&endpoint);
                }
            }

            for (endpoint, sub) in wanted {
                if !slot.registered.contains_key(&endpoint) {
                    additions.push((*id, sub));
                }
            }
        }

        // Removals above all happen before any registration below, so a
        // reused descriptor number is never deregistered under its new owner.
        for (id, sub) in additions {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            match registry.register(&mut SourceFd(&sub.fd), sub.id.token(), Interest::READABLE) {
                Ok(()) => {
                    trace!(handler = %id, endpoint = %sub.id, role = %sub.role, "Subscribed");
                    slot.registered.insert(sub.id, sub);
                    self.owners.insert(sub.id, (id, sub.role));
                }
                Err(e) => {
                    warn!(handler = %id, endpoint = %sub.id, error = %e, "Failed to subscribe endpoint");
                }
            }
        }
    }

    /// Blocks for readiness unless entries from an earlier poll are pending.
    fn wait(&mut self) -> Result<(), ReactorError> {
        if !self.ready.is_empty() {
            return Ok(());
        }

        match self
            .poll
            .poll(&mut self.events, Some(self.config.poll_timeout))
        {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            self.ready.push_back(EndpointId::from_token(event.token()));
        }
        Ok(())
    }

    /// Dispatches one ready endpoint, if any.
    fn dispatch_one(&mut self) {
        let Some(endpoint) = self.ready.pop_front() else {
            return;
        };

        let Some(&(id, role)) = self.owners.get(&endpoint) else {
            trace!(endpoint = %endpoint, "Dropping stale readiness");
            return;
        };
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if !slot.cell.begin() {
            return;
        }

        // Pre-processing: no further events for this handler until it is done
        let registry = self.poll.registry();
        for (registered, sub) in slot.registered.drain() {
            deregister(registry, &sub);
            self.owners.remove(&registered);
        }
        slot.cell.lock().pre_processing();

        trace!(handler = %id, endpoint = %endpoint, role = %role, "Dispatching");
        let task = Task {
            cell: Arc::clone(&slot.cell),
            role,
            endpoint,
        };
        if let Err(e) = self.pool.submit(task) {
            warn!(handler = %id, error = %e, "Failed to dispatch task");
            slot.cell.finish();
        }
    }

    fn shutdown(&mut self) {
        self.pool.shutdown();

        let registry = self.poll.registry();
        for (_, mut slot) in self.slots.drain() {
            for (_, sub) in slot.registered.drain() {
                deregister(registry, &sub);
            }
        }
        self.owners.clear();
        self.ready.clear();
    }
}

fn deregister(registry: &Registry, sub: &Subscription) {
    // A closed descriptor has already left the poll set
    if let Err(e) = registry.deregister(&mut SourceFd(&sub.fd)) {
        trace!(endpoint = %sub.id, error = %e, "Deregister failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameError, Message};
    use crate::reactor::endpoint::{pipe, PipeReader, PipeWriter};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct Tally {
        seen: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    /// Reads one message per event; stops after `limit` messages if set.
    struct PipeCounter {
        readers: Vec<PipeReader>,
        tally: Arc<Tally>,
        limit: Option<usize>,
        hold: Duration,
    }

    impl PipeCounter {
        fn new(readers: Vec<PipeReader>, tally: Arc<Tally>) -> Self {
            Self {
                readers,
                tally,
                limit: None,
                hold: Duration::ZERO,
            }
        }
    }

    impl Handler for PipeCounter {
        fn name(&self) -> &str {
            "pipe-counter"
        }

        fn process(&mut self, _role: Role, endpoint: EndpointId) {
            let now = self.tally.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.tally.max_active.fetch_max(now, Ordering::SeqCst);

            if let Some(reader) = self.readers.iter_mut().find(|r| r.id() == endpoint) {
                match reader.read_message() {
                    Ok(_) => {
                        self.tally.seen.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(FrameError::Empty) => {}
                    Err(FrameError::Closed) => {
                        // Drained and the writer is gone; stop watching it
                        self.readers.retain(|r| r.id() != endpoint);
                    }
                    Err(e) => panic!("unexpected frame error: {}", e),
                }
            }
            if !self.hold.is_zero() {
                thread::sleep(self.hold);
            }

            self.tally.active.fetch_sub(1, Ordering::SeqCst);
        }

        fn endpoints(&self) -> Vec<Subscription> {
            self.readers.iter().map(|r| r.subscription(true)).collect()
        }

        fn is_running(&self) -> bool {
            self.limit
                .map_or(true, |limit| self.tally.seen.load(Ordering::SeqCst) < limit)
        }
    }

    fn turn_until(reactor: &mut Reactor, deadline: Duration, mut done: impl FnMut(&Reactor) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done(reactor) {
                return true;
            }
            reactor.turn().unwrap();
        }
        done(reactor)
    }

    fn test_reactor(workers: usize) -> Reactor {
        Reactor::new(ReactorConfig {
            workers,
            poll_timeout: Duration::from_millis(10),
            event_capacity: 64,
        })
        .unwrap()
    }

    #[test]
    fn test_every_queued_message_is_dispatched() {
        let mut reactor = test_reactor(2);
        let (writer, reader) = pipe(Role::InternalLink).unwrap();
        let tally = Arc::new(Tally::default());
        reactor.register(Box::new(PipeCounter::new(vec![reader], Arc::clone(&tally))));

        // All five frames sit in the pipe before the first poll; one
        // message is read per dispatch, so re-arming must pick up the rest.
        for _ in 0..5 {
            writer.write_message(&Message::ping()).unwrap();
        }

        assert!(turn_until(&mut reactor, Duration::from_secs(3), |_| {
            tally.seen.load(Ordering::SeqCst) == 5
        }));
        assert_eq!(tally.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_flight_under_readiness_storm() {
        let mut reactor = test_reactor(4);

        let mut writers: Vec<PipeWriter> = Vec::new();
        let mut readers = Vec::new();
        for _ in 0..4 {
            let (w, r) = pipe(Role::ComLink).unwrap();
            writers.push(w);
            readers.push(r);
        }

        let tally = Arc::new(Tally::default());
        let mut handler = PipeCounter::new(readers, Arc::clone(&tally));
        handler.hold = Duration::from_micros(200);
        reactor.register(Box::new(handler));

        let per_writer = 50;
        let storm: Vec<_> = writers
            .into_iter()
            .map(|w| {
                thread::spawn(move || {
                    for _ in 0..per_writer {
                        w.write_message(&Message::ping()).unwrap();
                        thread::sleep(Duration::from_micros(50));
                    }
                })
            })
            .collect();

        assert!(turn_until(&mut reactor, Duration::from_secs(10), |_| {
            tally.seen.load(Ordering::SeqCst) == 4 * per_writer
        }));
        for t in storm {
            t.join().unwrap();
        }

        assert_eq!(tally.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finished_handler_is_pruned() {
        let mut reactor = test_reactor(1);
        let (writer, reader) = pipe(Role::InternalLink).unwrap();
        let tally = Arc::new(Tally::default());
        let mut handler = PipeCounter::new(vec![reader], Arc::clone(&tally));
        handler.limit = Some(1);
        reactor.register(Box::new(handler));
        assert_eq!(reactor.handler_count(), 1);

        writer.write_message(&Message::close()).unwrap();

        assert!(turn_until(&mut reactor, Duration::from_secs(3), |r| {
            r.handler_count() == 0
        }));
    }

    struct Brittle {
        reader: PipeReader,
    }

    impl Handler for Brittle {
        fn name(&self) -> &str {
            "brittle"
        }

        fn process(&mut self, _role: Role, _endpoint: EndpointId) {
            let _ = self.reader.read_message();
            panic!("handler state corrupted");
        }

        fn endpoints(&self) -> Vec<Subscription> {
            vec![self.reader.subscription(true)]
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_panicking_handler_is_pruned() {
        let mut reactor = test_reactor(1);
        let (writer, reader) = pipe(Role::ComLink).unwrap();
        reactor.register(Box::new(Brittle { reader }));

        // A healthy neighbour keeps being served on the same worker
        let (other_writer, other_reader) = pipe(Role::ComLink).unwrap();
        let tally = Arc::new(Tally::default());
        reactor.register(Box::new(PipeCounter::new(vec![other_reader], Arc::clone(&tally))));
        assert_eq!(reactor.handler_count(), 2);

        writer.write_message(&Message::ping()).unwrap();
        assert!(turn_until(&mut reactor, Duration::from_secs(3), |r| {
            r.handler_count() == 1
        }));

        other_writer.write_message(&Message::ping()).unwrap();
        assert!(turn_until(&mut reactor, Duration::from_secs(3), |_| {
            tally.seen.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn test_admission_through_handle() {
        let mut reactor = test_reactor(1);
        let handle = reactor.handle();

        let (writer, reader) = pipe(Role::ComLink).unwrap();
        let tally = Arc::new(Tally::default());
        let admitted = PipeCounter::new(vec![reader], Arc::clone(&tally));

        thread::spawn(move || handle.admit(Box::new(admitted)).unwrap())
            .join()
            .unwrap();
        writer.write_message(&Message::ping()).unwrap();

        assert!(turn_until(&mut reactor, Duration::from_secs(3), |_| {
            tally.seen.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(reactor.handler_count(), 1);
    }

    #[test]
    fn test_stop_ends_run() {
        let mut reactor = test_reactor(2);
        let handle = reactor.handle();
        assert!(handle.is_running());

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.stop();
        });

        reactor.run().unwrap();
        stopper.join().unwrap();
        assert_eq!(reactor.handler_count(), 0);
    }
}
