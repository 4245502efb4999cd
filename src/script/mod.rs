//! Script Module
//!
//! Command parsing, the interpreter boundary and the call-stack runner the
//! server feeds command batches into.
//!
//! ```text
//! CommandReq / ScriptResp text
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  parse_script   │  (command)
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │  ScriptRunner   │  (runner)
//! │  - call stack   │
//! │  - cycle check  │
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │  Interpreter    │  (interpreter)
//! └─────────────────┘
//! ```

pub mod command;
pub mod interpreter;
pub mod runner;

pub use command::{parse_script, Arg, ArgKind, Command, CommandError, CommandKind, ARG_FACTORIES};
pub use interpreter::{BasicInterpreter, Interpreter, Store, StoreError};
pub use runner::{FrameId, RunnerError, ScriptRunner};
