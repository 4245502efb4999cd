//! Dispatch Pool
//!
//! A fixed set of worker threads, each with its own FIFO queue. The reactor
//! hands every task to a worker picked uniformly at random; there is no work
//! stealing and no load metric.
//!
//! ```text
//!                 submit(task)
//!                      │ random worker
//!        ┌─────────────┼─────────────┐
//!        ▼             ▼             ▼
//!   ┌─────────┐   ┌─────────┐   ┌─────────┐
//!   │ queue 0 │   │ queue 1 │   │ queue N │
//!   │ worker  │   │ worker  │   │ worker  │
//!   └────┬────┘   └────┬────┘   └────┬────┘
//!        └─────────────┴─────────────┘
//!          process() + post_processing()
//!                      │
//!                      ▼
//!                wake reactor
//! ```
//!
//! The pool itself does not stop two tasks for the same handler from running
//! at once; the reactor never queues a second one while the first is in
//! flight.

use crate::reactor::endpoint::{EndpointId, Role};
use crate::reactor::handler::HandlerCell;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use mio::Waker;
use rand::Rng;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How long an idle worker sleeps before checking for shutdown again.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// One unit of work: run `cell` for an event on `endpoint`.
#[derive(Debug, Clone)]
pub struct Task {
    pub cell: Arc<HandlerCell>,
    pub role: Role,
    pub endpoint: EndpointId,
}

/// Counters for submitted and completed tasks.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
}

impl DispatchStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Errors returned by [`DispatchPool::submit`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch pool is shut down")]
    ShutDown,

    #[error("worker {0} is gone")]
    WorkerGone(usize),
}

/// Fixed-size worker pool.
pub struct DispatchPool {
    queues: Vec<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DispatchStats>,
}

impl DispatchPool {
    /// Spawns `size` workers (at least one). After each task a worker wakes
    /// `waker`, if given, so the reactor can restore subscriptions.
    pub fn new(size: usize, waker: Option<Arc<Waker>>) -> io::Result<Self> {
        let size = size.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(DispatchStats::default());

        let mut queues = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = unbounded();
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let waker = waker.clone();

            let worker = thread::Builder::new()
                .name(format!("relay-worker-{}", index))
                .spawn(move || worker_loop(index, rx, shutdown, stats, waker))?;

            queues.push(tx);
            workers.push(worker);
        }

        debug!(workers = size, "Dispatch pool started");

        Ok(Self {
            queues,
            workers,
            shutdown,
            stats,
        })
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Queues a task on a randomly chosen worker.
    pub fn submit(&self, task: Task) -> Result<(), DispatchError> {
        if self.queues.is_empty() {
            return Err(DispatchError::ShutDown);
        }

        let index = rand::thread_rng().gen_range(0..self.queues.len());
        trace!(
            worker = index,
            handler = %task.cell.id(),
            endpoint = %task.endpoint,
            "Submitting task"
        );

        self.queues[index]
            .send(task)
            .map_err(|_| DispatchError::WorkerGone(index))?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stops the workers after they drain their queues.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.shutdown.store(true, Ordering::Release);
        self.queues.clear();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Worker thread panicked");
            }
        }

        debug!(
            completed = self.stats.completed(),
            "Dispatch pool stopped"
        );
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    index: usize,
    queue: Receiver<Task>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DispatchStats>,
    waker: Option<Arc<Waker>>,
) {
    loop {
        match queue.recv_timeout(IDLE_SLEEP) {
            Ok(task) => {
                trace!(
                    worker = index,
                    handler = %task.cell.id(),
                    role = %task.role,
                    "Running task"
                );
                task.cell.run(task.role, task.endpoint);
                stats.completed.fetch_add(1, Ordering::Relaxed);

                if let Some(waker) = &waker {
                    if let Err(e) = waker.wake() {
                        warn!(worker = index, error = %e, "Failed to wake reactor");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::endpoint::Subscription;
    use crate::reactor::handler::{Handler, HandlerId};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Tally {
        hits: Arc<AtomicUsize>,
    }

    impl Handler for Tally {
        fn name(&self) -> &str {
            "tally"
        }

        fn process(&mut self, _role: Role, _endpoint: EndpointId) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }

        fn endpoints(&self) -> Vec<Subscription> {
            Vec::new()
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_every_task_runs() {
        let pool = DispatchPool::new(3, None).unwrap();
        assert_eq!(pool.size(), 3);

        let hits = Arc::new(AtomicUsize::new(0));
        let cells: Vec<_> = (0..10)
            .map(|i| {
                Arc::new(HandlerCell::new(
                    HandlerId(i),
                    Box::new(Tally {
                        hits: Arc::clone(&hits),
                    }),
                ))
            })
            .collect();

        for cell in &cells {
            assert!(cell.begin());
            pool.submit(Task {
                cell: Arc::clone(cell),
                role: Role::InternalLink,
                endpoint: EndpointId::next(),
            })
            .unwrap();
        }

        assert!(wait_for(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 10));
        assert!(wait_for(Duration::from_secs(1), || cells
            .iter()
            .all(|c| !c.is_in_flight())));

        let stats = pool.stats();
        assert_eq!(stats.submitted(), 10);
        assert!(wait_for(Duration::from_secs(1), || stats.completed() == 10));
    }

    #[test]
    fn test_zero_size_still_has_one_worker() {
        let pool = DispatchPool::new(0, None).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let mut pool = DispatchPool::new(2, None).unwrap();
        pool.shutdown();

        let cell = Arc::new(HandlerCell::new(
            HandlerId(99),
            Box::new(Tally {
                hits: Arc::new(AtomicUsize::new(0)),
            }),
        ));
        let result = pool.submit(Task {
            cell,
            role: Role::ComLink,
            endpoint: EndpointId::next(),
        });
        assert!(matches!(result, Err(DispatchError::ShutDown)));
    }
}
