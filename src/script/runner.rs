//! Script Runner
//!
//! Executes nested command batches on an explicit call stack instead of host
//! recursion.
//!
//! ```text
//!   stack (top last)          frame table
//!  ┌─────────────┐      ┌────────────────────────────────┐
//!  │ FrameId(b)  │ ───> │ b: [cmd, cmd]                  │
//!  │ FrameId(a)  │ ───> │ a: [cmd, cmd, cmd]             │
//!  └─────────────┘      └────────────────────────────────┘
//! ```
//!
//! A frame's id is the hash of its full command sequence. An id already in
//! the table means the same batch is still pending somewhere below, which is
//! a cycle; the runner then drops every pending frame and reports
//! [`RunnerError::RecursionDetected`].
//!
//! When a command needs external scripts, [`ScriptRunner::run`] puts the
//! frame's remaining commands back under the same id, pushes the id again and
//! returns the names. The caller fetches the scripts, adds them as
//! subroutines (which land above the suspended frame) and calls `run` again;
//! the suspended frame resumes once they are done.

use crate::script::command::Command;
use crate::script::interpreter::Interpreter;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::{debug, info, warn};

/// Structural hash of a command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u64);

impl FrameId {
    pub fn of(commands: &[Command]) -> Self {
        let mut hasher = DefaultHasher::new();
        commands.len().hash(&mut hasher);
        for command in commands {
            command.hash(&mut hasher);
        }
        FrameId(hasher.finish())
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Errors from the script runner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error("recursion detected: frame {0} is already pending")]
    RecursionDetected(FrameId),
}

/// Call-stack machine over an [`Interpreter`].
#[derive(Debug)]
pub struct ScriptRunner<I> {
    interpreter: I,
    frames: HashMap<FrameId, VecDeque<Command>>,
    stack: Vec<FrameId>,
    running: bool,
}

impl<I: Interpreter> ScriptRunner<I> {
    pub fn new(interpreter: I) -> Self {
        Self {
            interpreter,
            frames: HashMap::new(),
            stack: Vec::new(),
            running: true,
        }
    }

    /// Queues a single command as its own frame.
    pub fn add_command(&mut self, command: Command) -> Result<FrameId, RunnerError> {
        self.add_subroutine(vec![command])
    }

    /// Queues a batch of commands above everything pending.
    pub fn add_subroutine(&mut self, commands: Vec<Command>) -> Result<FrameId, RunnerError> {
        let id = FrameId::of(&commands);

        if self.frames.contains_key(&id) {
            warn!(frame = %id, pending = self.stack.len(), "Recursion detected; dropping all pending frames");
            self.clear();
            return Err(RunnerError::RecursionDetected(id));
        }

        debug!(frame = %id, commands = commands.len(), "Subroutine queued");
        self.frames.insert(id, commands.into());
        self.stack.push(id);
        Ok(id)
    }

    /// Runs pending frames until they are exhausted, a command needs
    /// scripts, or the interpreter halts.
    ///
    /// Returns the needed script names, or `None` otherwise; check
    /// [`is_running`](Self::is_running) to tell a halt from completion.
    pub fn run(&mut self) -> Option<Vec<String>> {
        while let Some(id) = self.stack.pop() {
            let Some(mut commands) = self.frames.remove(&id) else {
                continue;
            };

            while let Some(command) = commands.pop_front() {
                let deps = self.interpreter.exec(&command);

                if !self.interpreter.is_running() {
                    info!(frame = %id, "Interpreter halted; dropping pending frames");
                    self.clear();
                    self.running = false;
                    return None;
                }

                if let Some(deps) = deps {
                    // Resume exactly after this command once the deps ran
                    debug!(frame = %id, remaining = commands.len(), deps = ?deps, "Frame suspended");
                    self.frames.insert(id, commands);
                    self.stack.push(id);
                    return Some(deps);
                }
            }
        }
        None
    }

    /// Drops every pending frame.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.stack.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True when nothing is pending.
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Number of frames on the call stack.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    pub fn interpreter_mut(&mut self) -> &mut I {
        &mut self.interpreter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::command::{parse_script, CommandKind};
    use crate::script::interpreter::{BasicInterpreter, Store};

    /// Records what ran; `execute_script` requests its argument.
    #[derive(Default)]
    struct Recorder {
        ran: Vec<String>,
        halted: bool,
    }

    impl Interpreter for Recorder {
        fn exec(&mut self, command: &Command) -> Option<Vec<String>> {
            match command.kind {
                CommandKind::ExecuteScript => {
                    self.ran.push(command.to_string());
                    Some(vec![command.args[0].to_string()])
                }
                CommandKind::Exit => {
                    self.halted = true;
                    None
                }
                _ => {
                    self.ran.push(command.args[0].to_string());
                    None
                }
            }
        }

        fn is_running(&self) -> bool {
            !self.halted
        }

        fn drain_output(&mut self) -> Vec<String> {
            std::mem::take(&mut self.ran)
        }
    }

    fn script(text: &str) -> Vec<Command> {
        parse_script(text).unwrap()
    }

    #[test]
    fn test_suspended_frame_resumes_after_dependency() {
        let mut runner = ScriptRunner::new(Recorder::default());
        runner
            .add_subroutine(script("echo a\nexecute_script x\necho c"))
            .unwrap();

        let deps = runner.run();
        assert_eq!(deps, Some(vec!["x".to_string()]));
        assert_eq!(runner.depth(), 1);

        runner.add_subroutine(script("echo x1")).unwrap();
        assert_eq!(runner.depth(), 2);
        assert_eq!(runner.run(), None);
        assert!(runner.is_idle());
        assert!(runner.is_running());

        assert_eq!(
            runner.interpreter_mut().drain_output(),
            vec!["a", "execute_script x", "x1", "c"]
        );
    }

    #[test]
    fn test_pending_duplicate_clears_everything() {
        let mut runner = ScriptRunner::new(Recorder::default());
        runner.add_subroutine(script("echo one")).unwrap();
        runner.add_subroutine(script("echo two")).unwrap();

        let err = runner.add_subroutine(script("echo one")).unwrap_err();
        assert!(matches!(err, RunnerError::RecursionDetected(_)));
        assert!(runner.is_idle());
        assert_eq!(runner.depth(), 0);

        // Nothing left to run
        assert_eq!(runner.run(), None);
        assert!(runner.interpreter_mut().drain_output().is_empty());
    }

    #[test]
    fn test_self_including_script_is_detected() {
        let mut runner = ScriptRunner::new(Recorder::default());
        let body = "echo loop\nexecute_script self";

        runner.add_subroutine(script(body)).unwrap();
        assert_eq!(runner.run(), Some(vec!["self".to_string()]));

        // The suspended frame still holds its id, so the same body is a cycle
        assert!(runner.add_subroutine(script(body)).is_err());
        assert!(runner.is_idle());
    }

    #[test]
    fn test_sequential_readd_succeeds() {
        let mut runner = ScriptRunner::new(Recorder::default());
        let first = runner.add_subroutine(script("echo again")).unwrap();
        assert_eq!(runner.run(), None);

        let second = runner.add_subroutine(script("echo again")).unwrap();
        assert_eq!(first, second);
        assert_eq!(runner.run(), None);
        assert_eq!(
            runner.interpreter_mut().drain_output(),
            vec!["again", "again"]
        );
    }

    #[test]
    fn test_halt_drops_pending_work() {
        let mut runner = ScriptRunner::new(Recorder::default());
        runner.add_subroutine(script("echo below")).unwrap();
        runner
            .add_subroutine(script("echo before\nexit\necho after"))
            .unwrap();

        assert_eq!(runner.run(), None);
        assert!(!runner.is_running());
        assert!(runner.is_idle());
        assert_eq!(runner.interpreter_mut().drain_output(), vec!["before"]);
    }

    #[test]
    fn test_add_command_returns_output() {
        let mut runner = ScriptRunner::new(BasicInterpreter::new(Store::shared()));
        runner
            .add_command(Command::parse("set k v").unwrap())
            .unwrap();
        runner.add_command(Command::parse("get k").unwrap()).unwrap();

        assert_eq!(runner.run(), None);
        // Frames run top first
        assert_eq!(runner.interpreter_mut().drain_output(), vec!["(nil) k", "OK"]);
    }

    #[test]
    fn test_frame_id_is_structural() {
        assert_eq!(
            FrameId::of(&script("set a 1\nget a")),
            FrameId::of(&script("# same\nset a 1\n\nget a"))
        );
        assert_ne!(
            FrameId::of(&script("set a 1\nget a")),
            FrameId::of(&script("get a\nset a 1"))
        );
    }
}
