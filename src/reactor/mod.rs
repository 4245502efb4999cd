//! Reactor Module
//!
//! The event-driven core shared by client and server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Reactor                              │
//! │   mio::Poll ── ready endpoint ── owning handler             │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ one task per turn
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DispatchPool                            │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐                     │
//! │  │ worker 0 │ │ worker 1 │ │ worker N │                     │
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘                     │
//! └───────┼────────────┼────────────┼───────────────────────────┘
//!         ▼            ▼            ▼
//!   Handler::process ── fsm::drive ── codec read/write
//! ```
//!
//! ## Modules
//!
//! - `endpoint`: pipes, relay pairs and the datagram endpoint
//! - `fsm`: the state machine engine handlers are built on
//! - `handler`: the `Handler` trait and the single-flight cell
//! - `dispatch`: the worker pool
//! - `event_loop`: the reactor itself

pub mod dispatch;
pub mod endpoint;
pub mod event_loop;
pub mod fsm;
pub mod handler;

// Re-export commonly used types
pub use dispatch::{DispatchPool, DispatchStats, Task};
pub use endpoint::{
    pipe, relay_pair, Datagram, EndpointId, NetworkEndpoint, PipeReader, PipeWriter, RelayPair,
    Role, Subscription,
};
pub use event_loop::{
    Reactor, ReactorConfig, ReactorError, ReactorHandle, DEFAULT_POLL_TIMEOUT, DEFAULT_WORKERS,
};
pub use fsm::{drive, HandlerError, Machine};
pub use handler::{Handler, HandlerCell, HandlerId};
