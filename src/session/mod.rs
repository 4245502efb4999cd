//! Session Module
//!
//! Per-peer state on the server: packet reassembly, idle timers and the
//! relay to each peer's handler.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SessionTable                            │
//! │  peer addr ──> PeerSession { relay, packets, timer }        │
//! │  relay endpoint ──> peer addr                               │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │ Timeout(peer) via internal pipe
//!              ┌─────────────┴─────────────┐
//!              │       TimerService        │
//!              │   (Tokio timer runtime)   │
//!              └───────────────────────────┘
//! ```

pub mod table;
pub mod timer;

// Re-export commonly used types
pub use table::{Arrival, PeerSession, SessionTable, DEFAULT_REQUIRED_PACKETS};
pub use timer::{IdleTimer, Ticker, TimerConfig, TimerService, Timers, DISCONNECTION_DELAY};
