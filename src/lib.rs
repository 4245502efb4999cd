//! # Relay - Reactor-Driven Command Execution over UDP
//!
//! Relay is a small client/server platform: clients send batches of text
//! commands over UDP, the server runs them against a shared key-value store
//! and sends the output back. Scripts named by `execute_script` live on the
//! client and are fetched on demand, so a server never reads a client's files.
//!
//! ## Features
//!
//! - **Reactor Core**: A `mio` poll loop hands ready handlers to a pool of
//!   dispatch workers; a handler never runs on two workers at once
//! - **State Machines**: Every handler is an explicit state machine driven
//!   until it returns to `Idle`
//! - **Per-Peer Sessions**: Each peer gets its own command handler, linked to
//!   the socket handler by a relay of non-blocking pipes
//! - **Idle Disconnection**: Timers on a `tokio` runtime drop peers that stop
//!   sending, clients keep their sessions alive with pings
//! - **Nested Scripts**: A call stack of subroutine frames with recursion
//!   detection
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── client ────────────────────────────┐
//! │  stdin ─> ShellHandler <──relay──> ClientSocketHandler ─┐      │
//! │               ▲ script files              ▲ keepalive   │      │
//! └───────────────┼───────────────────────────┼─────────────┼──────┘
//!                 │                           │             │ UDP
//! ┌───────────────┼──────────── server ───────┼─────────────┼──────┐
//! │               ▼                           ▼             ▼      │
//! │        ┌─────────────────────────────────────────────────────┐ │
//! │        │               ServerSocketHandler                   │ │
//! │        │  SessionTable  ·  idle timers  ·  credential check  │ │
//! │        └─────┬───────────────────┬───────────────────┬───────┘ │
//! │              │ relay             │ relay             │ relay   │
//! │        ┌─────▼──────┐      ┌─────▼──────┐      ┌─────▼──────┐  │
//! │        │ ComHandler │      │ ComHandler │      │ ComHandler │  │
//! │        │ScriptRunner│      │ScriptRunner│      │ScriptRunner│  │
//! │        └─────┬──────┘      └─────┬──────┘      └─────┬──────┘  │
//! │              └───────────────────┼───────────────────┘         │
//! │                                  ▼                             │
//! │                        Arc<RwLock<Store>>                      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
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
//!
//! ## Commands
//!
//! - `help`, `echo <text>`, `exit`
//! - `set <key> <value>`, `get <key>`, `del <key>`, `add <key> <delta>`
//! - `list`, `size`, `clear`
//! - `execute_script <name>`
//!
//! ## Module Overview
//!
//! - [`protocol`]: Messages and the length-prefixed frame codec
//! - [`reactor`]: Endpoints, the poll loop, dispatch workers, handler FSMs
//! - [`session`]: Per-peer session table and the timer runtime
//! - [`script`]: Command parsing, the interpreter and the script runner
//! - [`server`]: Server socket handler and per-peer command handlers
//! - [`client`]: Client socket handler and the interactive shell
//! - [`config`]: Server and client settings

pub mod client;
pub mod config;
pub mod protocol;
pub mod reactor;
pub mod script;
pub mod server;
pub mod session;

// Re-export commonly used types for convenience
pub use client::{Client, ClientError};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{FrameError, Message, MessageKind};
pub use reactor::{Handler, Reactor, ReactorConfig, ReactorHandle};
pub use script::{BasicInterpreter, Interpreter, ScriptRunner, Store};
pub use server::{Server, ServerError, SessionStats};

/// The default UDP port the server listens on
pub const DEFAULT_PORT: u16 = 7878;

/// The default host the server binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of Relay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
