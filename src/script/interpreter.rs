//! Interpreter
//!
//! The [`Interpreter`] trait is what the script runner calls for each
//! command. [`BasicInterpreter`] is the bundled implementation: a handful of
//! key/value commands over a shared [`Store`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BasicInterpreter                         │
//! │                                                             │
//! │  exec(cmd) ──> dispatch by kind ──> cmd_*()                 │
//! │                                        │                    │
//! │                 output lines <─────────┤                    │
//! │                                        ▼                    │
//! │                             Arc<RwLock<Store>>              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store is injected, so several interpreters (one per connected peer)
//! can share one dataset or each own a private one.

use crate::script::command::{Arg, Command, CommandKind};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Executes commands on behalf of a [`ScriptRunner`](crate::script::ScriptRunner).
pub trait Interpreter {
    /// Executes one command.
    ///
    /// Returns the names of scripts the command needs before it can be
    /// considered done, or `None` when it completed.
    fn exec(&mut self, command: &Command) -> Option<Vec<String>>;

    /// False once the interpreter has halted.
    fn is_running(&self) -> bool;

    /// Takes the output produced since the last call.
    fn drain_output(&mut self) -> Vec<String>;
}

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("value of '{0}' is not an integer")]
    NotAnInteger(String),

    #[error("increment on '{0}' would overflow")]
    Overflow(String),
}

/// String key/value records, kept in key order.
#[derive(Debug, Default, Clone)]
pub struct Store {
    entries: BTreeMap<String, String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a new store for sharing between interpreters.
    pub fn shared() -> Arc<RwLock<Store>> {
        Arc::new(RwLock::new(Store::new()))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    /// Adds `delta` to a numeric value. A missing key counts as 0.
    pub fn add(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let current = match self.entries.get(key) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| StoreError::NotAnInteger(key.to_string()))?,
            None => 0,
        };

        let updated = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::Overflow(key.to_string()))?;
        self.entries.insert(key.to_string(), updated.to_string());
        Ok(updated)
    }
}

/// The bundled interpreter.
#[derive(Debug)]
pub struct BasicInterpreter {
    store: Arc<RwLock<Store>>,
    output: Vec<String>,
    running: bool,
}

impl BasicInterpreter {
    pub fn new(store: Arc<RwLock<Store>>) -> Self {
        Self {
            store,
            output: Vec::new(),
            running: true,
        }
    }

    pub fn store(&self) -> &Arc<RwLock<Store>> {
        &self.store
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    /// Text argument at `index`; parsing guarantees it is present.
    fn text<'a>(command: &'a Command, index: usize) -> &'a str {
        command.arg(index).and_then(Arg::as_text).unwrap_or_default()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn cmd_help(&mut self) {
        for kind in CommandKind::ALL {
            self.emit(kind.usage());
        }
    }

    fn cmd_set(&mut self, command: &Command) {
        let key = Self::text(command, 0);
        let value = Self::text(command, 1);
        self.write().set(key, value);
        self.emit("OK");
    }

    fn cmd_get(&mut self, command: &Command) {
        let key = Self::text(command, 0);
        let line = match self.read().get(key) {
            Some(value) => value.to_string(),
            None => format!("(nil) {}", key),
        };
        self.emit(line);
    }

    fn cmd_del(&mut self, command: &Command) {
        let key = Self::text(command, 0);
        let removed = self.write().remove(key).is_some();
        self.emit(if removed { "1" } else { "0" });
    }

    fn cmd_list(&mut self) {
        let lines: Vec<String> = self
            .read()
            .iter()
            .map(|(key, value)| format!("{} = {}", key, value))
            .collect();
        if lines.is_empty() {
            self.emit("(empty)");
        } else {
            self.output.extend(lines);
        }
    }

    fn cmd_add(&mut self, command: &Command) {
        let key = Self::text(command, 0);
        let delta = command.arg(1).and_then(Arg::as_int).unwrap_or(0);
        let result = self.write().add(key, delta);
        match result {
            Ok(value) => self.emit(value.to_string()),
            Err(e) => self.emit(format!("error: {}", e)),
        }
    }
}

impl Interpreter for BasicInterpreter {
    fn exec(&mut self, command: &Command) -> Option<Vec<String>> {
        if !self.running {
            return None;
        }
        debug!(command = %command, "Executing command");

        match command.kind {
            CommandKind::Help => self.cmd_help(),
            CommandKind::Echo => {
                let text = Self::text(command, 0).to_string();
                self.emit(text);
            }
            CommandKind::Set => self.cmd_set(command),
            CommandKind::Get => self.cmd_get(command),
            CommandKind::Del => self.cmd_del(command),
            CommandKind::List => self.cmd_list(),
            CommandKind::Size => {
                let size = self.read().len();
                self.emit(size.to_string());
            }
            CommandKind::Clear => {
                self.write().clear();
                self.emit("OK");
            }
            CommandKind::Add => self.cmd_add(command),
            CommandKind::ExecuteScript => {
                return Some(vec![Self::text(command, 0).to_string()]);
            }
            CommandKind::Exit => {
                info!("Interpreter halted by exit");
                self.running = false;
                self.emit("bye");
            }
        }
        None
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn drain_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }
}
