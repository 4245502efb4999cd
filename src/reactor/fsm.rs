//! Finite State Machine Engine
//!
//! Handlers advance in small steps. Each step runs the body of the current
//! state, performs at most one message read or write, and names exactly one
//! successor. [`drive`] repeats that until the machine is back in its idle
//! state, so one call runs one event to completion.
//!
//! ```text
//!            process(role, endpoint)
//!                     │
//!                     ▼
//!   ┌──────┐     ┌──────────┐  Ok(next)   ┌──────────┐
//!   │ Idle │<────│ NewEvent │────────────>│   ...    │───┐
//!   └──────┘     └──────────┘             └──────────┘   │ Err(e)
//!      ▲                                                 ▼
//!      │           recover(): drop in-flight data    ┌───────┐
//!      └─────────────────────────────────────────────│ Error │
//!                                                    └───────┘
//! ```
//!
//! A failing step never escapes the handler: the engine logs it, moves to
//! the error state, and the error state discards scratch data and returns to
//! idle.

use crate::protocol::FrameError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tracing::{trace, warn};

use crate::reactor::endpoint::EndpointId;

/// Errors a state body can raise.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Framing or transport failure
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error outside the codec (pipe creation, socket setup)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An event arrived on an endpoint the handler no longer owns
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),

    /// A message arrived for a peer without a session
    #[error("no session for peer {0}")]
    UnknownPeer(SocketAddr),

    /// The state was entered without the scratch data it needs
    #[error("missing in-flight data in state {0}")]
    MissingEvent(&'static str),
}

/// A handler's state machine.
pub trait Machine {
    type State: Copy + PartialEq + fmt::Debug;

    /// The resting state; [`drive`] returns when it is reached.
    const IDLE: Self::State;

    /// The shared failure state.
    const ERROR: Self::State;

    fn state(&self) -> Self::State;

    fn set_state(&mut self, state: Self::State);

    /// Runs the body of `state` and returns its successor.
    fn step(&mut self, state: Self::State) -> Result<Self::State, HandlerError>;

    /// Discards in-flight data after a failure.
    fn recover(&mut self) {}
}

/// Runs the machine until it is idle. Returns the number of steps taken.
pub fn drive<M: Machine>(machine: &mut M) -> usize {
    let mut steps = 0;

    loop {
        let state = machine.state();
        if state == M::IDLE {
            return steps;
        }
        steps += 1;

        if state == M::ERROR {
            machine.recover();
            machine.set_state(M::IDLE);
            continue;
        }

        match machine.step(state) {
            Ok(next) => {
                trace!(from = ?state, to = ?next, "State transition");
                machine.set_state(next);
            }
            Err(e) => {
                warn!(state = ?state, error = %e, "Handler step failed");
                machine.set_state(M::ERROR);
            }
        }
    }
}
