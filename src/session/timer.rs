//! Session Timers
//!
//! Idle-disconnection timers and keepalive tickers run as tasks on a small
//! dedicated Tokio runtime. A timer never touches session state: when it
//! fires it writes one framed message into an internal pipe, and the owning
//! handler picks that up through the reactor like any other event.
//!
//! ```text
//!  datagram from P ──> cancel P's timer ──> schedule a new one
//!                                                 │
//!                                    DISCONNECTION_DELAY later
//!                                                 ▼
//!                         internal pipe <── Timeout("P")
//!                               │
//!                               ▼
//!                   reactor ──> socket handler tears P down
//! ```
//!
//! Dropping an [`IdleTimer`] or a [`Ticker`] stops it.

use crate::protocol::{Message, MessageKind};
use crate::reactor::PipeWriter;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Time between the last datagram from a peer and its disconnection.
pub const DISCONNECTION_DELAY: Duration = Duration::from_millis(1000);

/// Configuration for the timer runtime.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Number of timer threads
    pub threads: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

/// Owns the runtime the timers run on.
pub struct TimerService {
    runtime: Runtime,
}

impl TimerService {
    pub fn new(config: TimerConfig) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.threads.max(1))
            .thread_name("session-timer")
            .enable_all()
            .build()?;

        debug!(threads = config.threads.max(1), "Timer service started");
        Ok(Self { runtime })
    }

    /// A clonable handle for scheduling timers.
    pub fn timers(&self) -> Timers {
        Timers {
            handle: self.runtime.handle().clone(),
        }
    }

    /// Runs `on_signal` once when Ctrl+C is received.
    pub fn on_ctrl_c<F>(&self, on_signal: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime.spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => on_signal(),
                Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
            }
        });
    }
}

/// Schedules timers on a [`TimerService`].
#[derive(Clone, Debug)]
pub struct Timers {
    handle: Handle,
}

impl Timers {
    /// Arms a one-shot timer that writes `Timeout(peer)` into `notify`
    /// after `delay`.
    pub fn schedule(&self, peer: SocketAddr, delay: Duration, notify: PipeWriter) -> IdleTimer {
        // Fixed before spawning so the timer never fires ahead of `deadline`
        let deadline = Instant::now() + delay;
        let task = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;

            let message = Message::new(MessageKind::Timeout, peer.to_string());
            match notify.write_message(&message) {
                Ok(()) => trace!(peer = %peer, "Idle timer fired"),
                Err(e) => warn!(peer = %peer, error = %e, "Failed to deliver idle timeout"),
            }
        });

        IdleTimer {
            peer,
            deadline,
            task,
        }
    }

    /// Starts a ticker writing `message` into `notify` every `period`.
    pub fn every(&self, period: Duration, notify: PipeWriter, message: Message) -> Ticker {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.handle
            .spawn(ticker_loop(period, notify, message, shutdown_rx));
        Ticker { shutdown_tx }
    }
}

/// A pending idle timeout for one peer.
#[derive(Debug)]
pub struct IdleTimer {
    peer: SocketAddr,
    deadline: Instant,
    task: JoinHandle<()>,
}

impl IdleTimer {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Cancels the timer. A timer that already fired is unaffected.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A periodic notification; stopped when dropped.
#[derive(Debug)]
pub struct Ticker {
    shutdown_tx: watch::Sender<bool>,
}

impl Ticker {
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn ticker_loop(
    period: Duration,
    notify: PipeWriter,
    message: Message,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Ticker received shutdown signal");
                    return;
                }
            }
        }

        if let Err(e) = notify.write_message(&message) {
            warn!(error = %e, "Failed to deliver tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameError;
    use crate::reactor::{pipe, Role};
    use std::thread;

    fn service() -> TimerService {
        TimerService::new(TimerConfig::default()).unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    // Each test keeps its own writer open: once every writer is gone the
    // reader reports Closed instead of Empty.

    #[test]
    fn test_timer_fires_into_pipe() {
        let service = service();
        let (writer, mut reader) = pipe(Role::InternalLink).unwrap();

        let timer = service
            .timers()
            .schedule(peer(), Duration::from_millis(20), writer.clone());
        assert_eq!(timer.peer(), peer());

        thread::sleep(Duration::from_millis(150));
        assert!(timer.is_finished());

        let msg = reader.read_message().unwrap();
        assert_eq!(msg.kind, MessageKind::Timeout);
        assert_eq!(msg.text(), "127.0.0.1:40000");
        assert_eq!(reader.read_message(), Err(FrameError::Empty));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let service = service();
        let (writer, mut reader) = pipe(Role::InternalLink).unwrap();

        let timer = service
            .timers()
            .schedule(peer(), Duration::from_millis(40), writer.clone());
        timer.cancel();

        thread::sleep(Duration::from_millis(120));
        assert_eq!(reader.read_message(), Err(FrameError::Empty));
    }

    #[test]
    fn test_dropping_timer_cancels_it() {
        let service = service();
        let (writer, mut reader) = pipe(Role::InternalLink).unwrap();

        drop(
            service
                .timers()
                .schedule(peer(), Duration::from_millis(40), writer.clone()),
        );

        thread::sleep(Duration::from_millis(120));
        assert_eq!(reader.read_message(), Err(FrameError::Empty));
    }

    #[test]
    fn test_ticker_repeats_until_dropped() {
        let service = service();
        let (writer, mut reader) = pipe(Role::InternalLink).unwrap();

        let ticker = service.timers().every(
            Duration::from_millis(10),
            writer.clone(),
            Message::empty(MessageKind::Tick),
        );
        thread::sleep(Duration::from_millis(80));
        drop(ticker);

        let mut ticks = 0;
        while let Ok(msg) = reader.read_message() {
            assert_eq!(msg.kind, MessageKind::Tick);
            ticks += 1;
        }
        assert!(ticks >= 3, "only {} ticks", ticks);

        // Give an in-flight tick a chance to land, then nothing more arrives
        thread::sleep(Duration::from_millis(30));
        while reader.read_message().is_ok() {}
        thread::sleep(Duration::from_millis(50));
        assert_eq!(reader.read_message(), Err(FrameError::Empty));
    }
}
