//! Server Module
//!
//! Wires the reactor, the timer runtime and the socket handler into a
//! runnable UDP command server.
//!
//! ## Architecture
//!
//! ```text
//!            UDP datagrams
//!                 │
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ServerSocketHandler                         │
//! │   sessions, reassembly, idle timers, credential check       │
//! └───────┬─────────────────────┬─────────────────────┬─────────┘
//!         │ relay               │ relay               │ relay
//!         ▼                     ▼                     ▼
//!   ┌────────────┐        ┌────────────┐        ┌────────────┐
//!   │ ComHandler │        │ ComHandler │        │ ComHandler │
//!   │  (peer A)  │        │  (peer B)  │        │  (peer N)  │
//!   └─────┬──────┘        └─────┬──────┘        └─────┬──────┘
//!         └─────────────────────┼─────────────────────┘
//!                               ▼
//!                     Arc<RwLock<Store>>
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use relay::config::ServerConfig;
//! use relay::server::Server;
//!
//! let server = Server::bind(&ServerConfig::default())?;
//! let handle = server.handle();
//! server.on_ctrl_c(move || handle.stop());
//! server.run()?;
//! ```

pub mod com;
pub mod socket;

pub use com::{ComHandler, ComState};
pub use socket::{PeerFactory, ServerSocketHandler, SessionStats, SocketConfig, SocketState};

use crate::config::ServerConfig;
use crate::reactor::{Handler, NetworkEndpoint, Reactor, ReactorError, ReactorHandle};
use crate::script::{BasicInterpreter, Store};
use crate::session::TimerService;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Errors raised while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("cannot resolve bind address '{0}'")]
    BadAddress(String),
}

/// A bound, not yet running server.
pub struct Server {
    reactor: Reactor,
    timers: TimerService,
    local_addr: SocketAddr,
    store: Arc<RwLock<Store>>,
    stats: Arc<SessionStats>,
}

impl Server {
    /// Binds the socket and registers the socket handler.
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let address = config.bind_address();
        let addr = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ServerError::BadAddress(address.clone()))?;

        let mut reactor = Reactor::new(config.reactor())?;
        let timers = TimerService::new(config.timers())?;
        let network = NetworkEndpoint::bind(addr)?;
        let local_addr = network.local_addr()?;

        let store = Store::shared();
        let factory_store = Arc::clone(&store);
        let factory: PeerFactory = Box::new(move |peer, relay| -> Box<dyn Handler> {
            let interpreter = BasicInterpreter::new(Arc::clone(&factory_store));
            Box::new(ComHandler::new(peer, relay, interpreter))
        });

        let socket = ServerSocketHandler::new(
            SocketConfig {
                disconnection_delay: config.disconnection_delay,
                credential: config.credential.clone(),
            },
            network,
            timers.timers(),
            reactor.handle(),
            factory,
        )?;
        let stats = socket.stats();
        reactor.register(Box::new(socket));

        info!(addr = %local_addr, "Server bound");
        Ok(Self {
            reactor,
            timers,
            local_addr,
            store,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// The dataset every peer's interpreter works on.
    pub fn store(&self) -> Arc<RwLock<Store>> {
        Arc::clone(&self.store)
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Runs `on_signal` when Ctrl+C is received.
    pub fn on_ctrl_c<F>(&self, on_signal: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.timers.on_ctrl_c(on_signal);
    }

    /// Runs until the reactor is stopped.
    pub fn run(mut self) -> Result<(), ServerError> {
        self.reactor.run()?;
        Ok(())
    }
}
