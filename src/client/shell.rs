//! Shell Handler
//!
//! The user-facing end of the client. A pump thread turns input lines into
//! `CommandReq` messages on a pipe; the handler forwards them to the socket
//! handler, prints responses, and answers the server's script requests with
//! files from the script directory.
//!
//! ```text
//!  stdin ──> pump thread ──> [ShellLink pipe] ──> ShellHandler ──> relay ──> socket
//!                                                      ▲
//!  stdout <── CommandResp ─────────────────────────────┤
//!  script_dir ──> ScriptResp ──────────────────────────┘ (on ScriptReq)
//! ```
//!
//! One request is in flight at a time: the next line is only taken once the
//! previous request's response has been printed. End of input sends `exit`,
//! so the server closes the session and the reactor stops once the server's
//! `Close` comes back.

use crate::protocol::{FrameError, Message, MessageKind};
use crate::reactor::{
    drive, EndpointId, Handler, HandlerError, Machine, PipeReader, PipeWriter, ReactorHandle,
    RelayPair, Role, Subscription,
};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Back-off for the pump when the pipe is full.
const PUMP_RETRY: Duration = Duration::from_millis(5);

/// States of a [`ShellHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Idle,
    NewEvent,
    NewShellEvent,
    NewResponse,
    SendScripts,
    Error,
}

/// Prints responses and feeds requests.
pub struct ShellHandler {
    state: ShellState,
    lines: PipeReader,
    lines_open: bool,
    awaiting: bool,
    relay: RelayPair,
    script_dir: PathBuf,
    output: Box<dyn Write + Send>,
    reactor: ReactorHandle,
    running: bool,

    event: Option<Role>,
    pending_scripts: VecDeque<String>,
}

impl ShellHandler {
    /// `lines` is fed by [`spawn_line_pump`]; `relay` is the shell side of
    /// the relay to the socket handler.
    pub fn new(
        lines: PipeReader,
        relay: RelayPair,
        script_dir: impl Into<PathBuf>,
        output: Box<dyn Write + Send>,
        reactor: ReactorHandle,
    ) -> Self {
        Self {
            state: ShellState::Idle,
            lines,
            lines_open: true,
            awaiting: false,
            relay,
            script_dir: script_dir.into(),
            output,
            reactor,
            running: true,
            event: None,
            pending_scripts: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ShellState {
        self.state
    }

    fn print(&mut self, line: &str) {
        if let Err(e) = writeln!(self.output, "{}", line).and_then(|_| self.output.flush()) {
            warn!(error = %e, "Failed to write output");
        }
    }

    fn stop(&mut self) {
        self.running = false;
        self.reactor.stop();
    }

    fn on_new_event(&mut self) -> Result<ShellState, HandlerError> {
        let role = self.event.ok_or(HandlerError::MissingEvent("NewEvent"))?;
        let next = match role {
            Role::ShellLink => ShellState::NewShellEvent,
            Role::ComLink => ShellState::NewResponse,
            Role::NetworkLink | Role::InternalLink => {
                warn!(role = %role, "Unexpected event role");
                ShellState::Idle
            }
        };
        Ok(next)
    }

    fn on_new_shell_event(&mut self) -> Result<ShellState, HandlerError> {
        match self.lines.read_message() {
            Ok(request) => {
                debug!(request = %request.text(), "Sending request");
                self.relay.writer.write_message(&request)?;
                self.awaiting = true;
                Ok(ShellState::Idle)
            }
            Err(FrameError::Empty) => Ok(ShellState::Idle),
            Err(FrameError::Closed) => {
                self.lines_open = false;
                Ok(ShellState::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_new_response(&mut self) -> Result<ShellState, HandlerError> {
        let message = match self.relay.reader.read_message() {
            Ok(message) => message,
            Err(FrameError::Empty) => return Ok(ShellState::Idle),
            Err(FrameError::Closed) => {
                warn!("Socket handler is gone");
                self.stop();
                return Ok(ShellState::Idle);
            }
            Err(e) if e.is_protocol() => {
                warn!(error = %e, "Ignoring malformed response");
                return Ok(ShellState::Idle);
            }
            Err(e) => return Err(e.into()),
        };

        match message.kind {
            MessageKind::CommandResp => {
                for line in message.text().lines() {
                    self.print(line);
                }
                self.awaiting = false;
                Ok(ShellState::Idle)
            }
            MessageKind::ScriptReq => {
                self.pending_scripts.extend(message.payload_lines());
                Ok(ShellState::SendScripts)
            }
            MessageKind::Close => {
                info!("Session closed by server");
                self.print("Connection closed.");
                self.stop();
                Ok(ShellState::Idle)
            }
            other => {
                warn!(kind = %other, "Ignoring unexpected message");
                Ok(ShellState::Idle)
            }
        }
    }

    /// Sends one requested script; loops until all are sent.
    fn on_send_scripts(&mut self) -> Result<ShellState, HandlerError> {
        let Some(name) = self.pending_scripts.pop_front() else {
            return Ok(ShellState::Idle);
        };

        let body = match load_script(&self.script_dir, &name) {
            Ok(body) => body,
            Err(e) => {
                warn!(script = %name, error = %e, "Cannot read script");
                self.print(&format!("error: cannot read script '{}': {}", name, e));
                String::new()
            }
        };

        debug!(script = %name, bytes = body.len(), "Sending script");
        let payload = format!("{}\n{}", name, body);
        self.relay
            .writer
            .write_message(&Message::new(MessageKind::ScriptResp, payload))?;

        if self.pending_scripts.is_empty() {
            Ok(ShellState::Idle)
        } else {
            Ok(ShellState::SendScripts)
        }
    }
}

/// Reads `name` from `dir`. Names are plain file names.
fn load_script(dir: &Path, name: &str) -> io::Result<String> {
    let plain = Path::new(name)
        .file_name()
        .map_or(false, |file| file == name);
    if !plain {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "script names must be plain file names",
        ));
    }
    fs::read_to_string(dir.join(name))
}

impl Machine for ShellHandler {
    type State = ShellState;

    const IDLE: ShellState = ShellState::Idle;
    const ERROR: ShellState = ShellState::Error;

    fn state(&self) -> ShellState {
        self.state
    }

    fn set_state(&mut self, state: ShellState) {
        self.state = state;
    }

    fn step(&mut self, state: ShellState) -> Result<ShellState, HandlerError> {
        match state {
            ShellState::NewEvent => self.on_new_event(),
            ShellState::NewShellEvent => self.on_new_shell_event(),
            ShellState::NewResponse => self.on_new_response(),
            ShellState::SendScripts => self.on_send_scripts(),
            ShellState::Idle | ShellState::Error => Ok(ShellState::Idle),
        }
    }

    fn recover(&mut self) {
        self.pending_scripts.clear();
    }
}

impl Handler for ShellHandler {
    fn name(&self) -> &str {
        "shell"
    }

    fn process(&mut self, role: Role, _endpoint: EndpointId) {
        self.event = Some(role);
        self.state = ShellState::NewEvent;
        drive(self);
        self.event = None;
    }

    fn endpoints(&self) -> Vec<Subscription> {
        vec![
            self.lines
                .subscription(self.running && self.lines_open && !self.awaiting),
            self.relay.reader.subscription(self.running),
        ]
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// Spawns a thread writing each non-blank input line as a `CommandReq`.
/// End of input sends `exit`.
pub fn spawn_line_pump<R>(input: R, lines: PipeWriter) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("shell-input".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Input error");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                if !push_line(&lines, line.trim()) {
                    return;
                }
            }
            push_line(&lines, "exit");
        })
}

fn push_line(lines: &PipeWriter, line: &str) -> bool {
    let request = Message::new(MessageKind::CommandReq, line.to_string());
    loop {
        match lines.write_message(&request) {
            Ok(()) => return true,
            Err(FrameError::Empty) => thread::sleep(PUMP_RETRY),
            Err(e) => {
                debug!(error = %e, "Shell input pipe closed");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{pipe, relay_pair, Reactor, ReactorConfig};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        shell: ShellHandler,
        lines: PipeWriter,
        socket: RelayPair,
        out: SharedBuf,
        reactor: Reactor,
    }

    fn fixture(script_dir: PathBuf) -> Fixture {
        let reactor = Reactor::new(ReactorConfig {
            workers: 1,
            ..ReactorConfig::default()
        })
        .unwrap();
        let (lines_tx, lines_rx) = pipe(Role::ShellLink).unwrap();
        let (socket_side, shell_side) = relay_pair(Role::ComLink, Role::ComLink).unwrap();
        let out = SharedBuf::default();
        let shell = ShellHandler::new(
            lines_rx,
            shell_side,
            script_dir,
            Box::new(out.clone()),
            reactor.handle(),
        );
        Fixture {
            shell,
            lines: lines_tx,
            socket: socket_side,
            out,
            reactor,
        }
    }

    fn respond(fx: &mut Fixture, message: Message) {
        fx.socket.writer.write_message(&message).unwrap();
        let endpoint = fx.shell.relay.reader.id();
        fx.shell.process(Role::ComLink, endpoint);
        assert_eq!(fx.shell.state(), ShellState::Idle);
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relay-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_lines_are_forwarded() {
        let mut fx = fixture(PathBuf::from("."));
        fx.lines
            .write_message(&Message::new(MessageKind::CommandReq, "size"))
            .unwrap();
        let endpoint = fx.shell.lines.id();
        fx.shell.process(Role::ShellLink, endpoint);

        let forwarded = fx.socket.reader.read_message().unwrap();
        assert_eq!(forwarded.kind, MessageKind::CommandReq);
        assert_eq!(forwarded.text(), "size");
    }

    #[test]
    fn test_input_waits_for_response() {
        let mut fx = fixture(PathBuf::from("."));
        let lines_id = fx.shell.lines.id();
        let wants_lines = |shell: &ShellHandler| {
            shell
                .endpoints()
                .iter()
                .any(|sub| sub.id == lines_id && sub.wanted)
        };

        fx.lines
            .write_message(&Message::new(MessageKind::CommandReq, "get a"))
            .unwrap();
        fx.shell.process(Role::ShellLink, lines_id);
        assert!(!wants_lines(&fx.shell));

        // A script request is not the end of the request
        respond(&mut fx, Message::lines(MessageKind::ScriptReq, &["none"]));
        assert!(!wants_lines(&fx.shell));

        respond(&mut fx, Message::lines(MessageKind::CommandResp, &["(nil) a"]));
        assert!(wants_lines(&fx.shell));
    }

    #[test]
    fn test_responses_are_printed() {
        let mut fx = fixture(PathBuf::from("."));
        respond(&mut fx, Message::lines(MessageKind::CommandResp, &["OK", "42"]));
        assert_eq!(fx.out.text(), "OK\n42\n");
    }

    #[test]
    fn test_script_requests_are_answered_from_dir() {
        let dir = scratch_dir("shell-scripts");
        fs::write(dir.join("setup"), "set a 1\nget a\n").unwrap();

        let mut fx = fixture(dir.clone());
        respond(&mut fx, Message::lines(MessageKind::ScriptReq, &["setup", "missing"]));

        let first = fx.socket.reader.read_message().unwrap();
        assert_eq!(first.kind, MessageKind::ScriptResp);
        assert_eq!(first.text(), "setup\nset a 1\nget a\n");

        let second = fx.socket.reader.read_message().unwrap();
        assert_eq!(second.text(), "missing\n");
        assert!(fx.out.text().contains("cannot read script 'missing'"));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_script_names_cannot_escape_dir() {
        let dir = scratch_dir("shell-escape");
        assert!(load_script(&dir, "../etc/passwd").is_err());
        assert!(load_script(&dir, "nested/file").is_err());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_close_stops_reactor() {
        let mut fx = fixture(PathBuf::from("."));
        let handle = fx.reactor.handle();
        assert!(handle.is_running());

        respond(&mut fx, Message::close());
        assert!(!fx.shell.is_running());
        assert!(!handle.is_running());
        assert!(fx.out.text().contains("Connection closed."));
    }

    #[test]
    fn test_pump_sends_lines_then_exit() {
        let (tx, mut rx) = pipe(Role::ShellLink).unwrap();
        let input = Cursor::new("set a 1\n\n   \nget a\n");
        spawn_line_pump(input, tx).unwrap().join().unwrap();

        let sent: Vec<String> = std::iter::from_fn(|| rx.read_message().ok())
            .map(|m| m.text())
            .collect();
        assert_eq!(sent, vec!["set a 1", "get a", "exit"]);
    }
}
