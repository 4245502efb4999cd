//! Per-Peer Command Handler
//!
//! One [`ComHandler`] is admitted for every peer the server hears from. It
//! sits at the far end of the peer's relay, turns command batches and script
//! bodies into subroutines for its own [`ScriptRunner`], and writes the
//! results back through the relay.
//!
//! ```text
//!            ┌──────────┐
//!            │   Idle   │<─────────────────────────────────┐
//!            └────┬─────┘                                  │
//!                 ▼                                        │
//!            ┌──────────┐  Close / EOF                     │
//!            │ NewEvent │──────────────────────────────────┤
//!            └────┬─────┘                                  │
//!                 ▼                                        │
//!           ┌────────────┐  parse error / recursion        │
//!           │ NewRequest │─────────────────┐               │
//!           └─────┬──────┘                 ▼               │
//!                 ▼                 ┌──────────────┐       │
//!           ┌───────────┐ done      │ SendResponse │───────┤
//!           │ RunScript │──────────>└──────┬───────┘       │
//!           └─────┬─────┘                  │ halted        │
//!                 │ deps                   ▼               │
//!                 │             ┌───────────────────┐      │
//!                 └────────────>│ SendScriptRequest │──────┤
//!                               └───────────────────┘      │
//!                                      ┌─────────┐         │
//!                                      │ Closing │─────────┘
//!                                      └─────────┘
//! ```

use crate::protocol::{FrameError, Message, MessageKind};
use crate::reactor::{drive, EndpointId, Handler, HandlerError, Machine, RelayPair, Role, Subscription};
use crate::script::{parse_script, Interpreter, RunnerError, ScriptRunner};
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

/// States of a [`ComHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComState {
    Idle,
    NewEvent,
    NewRequest,
    RunScript,
    SendResponse,
    SendScriptRequest,
    Closing,
    Error,
}

/// Runs one peer's commands.
pub struct ComHandler<I> {
    name: String,
    peer: SocketAddr,
    relay: RelayPair,
    runner: ScriptRunner<I>,
    state: ComState,
    running: bool,

    // Scratch for the event in progress
    event: Option<EndpointId>,
    inbound: Option<Message>,
    response: Vec<String>,
    deps: Option<Vec<String>>,
}

impl<I: Interpreter> ComHandler<I> {
    /// Creates the handler for `peer`. `relay` is the peer side of the relay
    /// pair; its reader carries traffic coming from the network.
    pub fn new(peer: SocketAddr, relay: RelayPair, interpreter: I) -> Self {
        Self {
            name: format!("com-{}", peer),
            peer,
            relay,
            runner: ScriptRunner::new(interpreter),
            state: ComState::Idle,
            running: true,
            event: None,
            inbound: None,
            response: Vec::new(),
            deps: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ComState {
        self.state
    }

    pub fn runner(&self) -> &ScriptRunner<I> {
        &self.runner
    }

    fn send(&mut self, message: &Message) -> Result<(), HandlerError> {
        match self.relay.writer.write_message(message) {
            Ok(()) => Ok(()),
            Err(FrameError::Closed) => {
                // The socket side is gone; nobody is left to answer
                self.running = false;
                Err(FrameError::Closed.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_new_event(&mut self) -> Result<ComState, HandlerError> {
        let endpoint = self
            .event
            .take()
            .ok_or(HandlerError::MissingEvent("NewEvent"))?;
        if endpoint != self.relay.reader.id() {
            return Err(HandlerError::UnknownEndpoint(endpoint));
        }

        match self.relay.reader.read_message() {
            Ok(message) => {
                self.inbound = Some(message);
                Ok(ComState::NewRequest)
            }
            Err(FrameError::Empty) => Ok(ComState::Idle),
            Err(FrameError::Closed) => {
                debug!(peer = %self.peer, "Relay closed");
                self.running = false;
                Ok(ComState::Idle)
            }
            Err(e) if e.is_protocol() => {
                warn!(peer = %self.peer, error = %e, "Ignoring malformed message");
                Ok(ComState::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_new_request(&mut self) -> Result<ComState, HandlerError> {
        let message = self
            .inbound
            .take()
            .ok_or(HandlerError::MissingEvent("NewRequest"))?;

        let batch = match message.kind {
            MessageKind::CommandReq => message.text(),
            MessageKind::ScriptResp => {
                let text = message.text();
                let (name, body) = text.split_once('\n').unwrap_or((text.as_str(), ""));
                let name = name.trim().to_string();
                let body = body.to_string();

                if body.trim().is_empty() {
                    // The client could not supply it; the suspended batch
                    // cannot complete
                    warn!(peer = %self.peer, script = %name, "Script missing or empty");
                    self.runner.clear();
                    return Ok(
                        self.fail_request(format!("error: script '{}' is missing or empty", name))
                    );
                }
                debug!(peer = %self.peer, script = %name, "Script received");
                body
            }
            MessageKind::Close => {
                info!(peer = %self.peer, "Session closed");
                self.running = false;
                return Ok(ComState::Idle);
            }
            other => {
                warn!(peer = %self.peer, kind = %other, "Ignoring unexpected message");
                return Ok(ComState::Idle);
            }
        };

        let commands = match parse_script(&batch) {
            Ok(commands) => commands,
            Err(e) => {
                if message.kind == MessageKind::ScriptResp {
                    self.runner.clear();
                }
                return Ok(self.fail_request(format!("error: {}", e)));
            }
        };
        if commands.is_empty() {
            return Ok(ComState::RunScript);
        }

        match self.runner.add_subroutine(commands) {
            Ok(_) => Ok(ComState::RunScript),
            Err(RunnerError::RecursionDetected(frame)) => Ok(self.fail_request(format!(
                "error: recursion detected (frame {}); all queued scripts cleared",
                frame
            ))),
        }
    }

    /// Output stays with the interpreter while scripts are outstanding, so
    /// each request gets exactly one response.
    fn on_run_script(&mut self) -> Result<ComState, HandlerError> {
        match self.runner.run() {
            Some(deps) => {
                self.deps = Some(deps);
                Ok(ComState::SendScriptRequest)
            }
            None => {
                self.response = self.runner.interpreter_mut().drain_output();
                Ok(ComState::SendResponse)
            }
        }
    }

    /// Ends the request with its output so far plus an error line.
    fn fail_request(&mut self, error: String) -> ComState {
        self.response = self.runner.interpreter_mut().drain_output();
        self.response.push(error);
        ComState::SendResponse
    }

    fn on_send_response(&mut self) -> Result<ComState, HandlerError> {
        let lines = std::mem::take(&mut self.response);
        trace!(peer = %self.peer, lines = lines.len(), "Sending response");
        self.send(&Message::lines(MessageKind::CommandResp, &lines))?;

        if self.runner.is_running() {
            Ok(ComState::Idle)
        } else {
            Ok(ComState::Closing)
        }
    }

    fn on_send_script_request(&mut self) -> Result<ComState, HandlerError> {
        let deps = self
            .deps
            .take()
            .ok_or(HandlerError::MissingEvent("SendScriptRequest"))?;
        debug!(peer = %self.peer, scripts = ?deps, "Requesting scripts");
        self.send(&Message::lines(MessageKind::ScriptReq, &deps))?;
        Ok(ComState::Idle)
    }

    fn on_closing(&mut self) -> Result<ComState, HandlerError> {
        info!(peer = %self.peer, "Interpreter halted; closing session");
        self.running = false;
        self.send(&Message::close())?;
        Ok(ComState::Idle)
    }
}

impl<I: Interpreter> Machine for ComHandler<I> {
    type State = ComState;

    const IDLE: ComState = ComState::Idle;
    const ERROR: ComState = ComState::Error;

    fn state(&self) -> ComState {
        self.state
    }

    fn set_state(&mut self, state: ComState) {
        self.state = state;
    }

    fn step(&mut self, state: ComState) -> Result<ComState, HandlerError> {
        match state {
            ComState::NewEvent => self.on_new_event(),
            ComState::NewRequest => self.on_new_request(),
            ComState::RunScript => self.on_run_script(),
            ComState::SendResponse => self.on_send_response(),
            ComState::SendScriptRequest => self.on_send_script_request(),
            ComState::Closing => self.on_closing(),
            ComState::Idle | ComState::Error => Ok(ComState::Idle),
        }
    }

    fn recover(&mut self) {
        self.event = None;
        self.inbound = None;
        self.response.clear();
        self.deps = None;
    }
}

impl<I: Interpreter + Send> Handler for ComHandler<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, role: Role, endpoint: EndpointId) {
        trace!(peer = %self.peer, role = %role, endpoint = %endpoint, "Com event");
        self.event = Some(endpoint);
        self.state = ComState::NewEvent;
        drive(self);
    }

    fn endpoints(&self) -> Vec<Subscription> {
        vec![self.relay.reader.subscription(self.running)]
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::relay_pair;
    use crate::script::{BasicInterpreter, Store};

    /// A ComHandler plus the socket side of its relay.
    fn setup() -> (ComHandler<BasicInterpreter>, RelayPair) {
        let (socket_side, peer_side) = relay_pair(Role::ComLink, Role::NetworkLink).unwrap();
        let peer: SocketAddr = "127.0.0.1:45000".parse().unwrap();
        let handler = ComHandler::new(peer, peer_side, BasicInterpreter::new(Store::shared()));
        (handler, socket_side)
    }

    fn deliver(handler: &mut ComHandler<BasicInterpreter>, socket: &RelayPair, message: Message) {
        socket.writer.write_message(&message).unwrap();
        let endpoint = handler.relay.reader.id();
        handler.process(Role::NetworkLink, endpoint);
        assert_eq!(handler.state(), ComState::Idle);
    }

    fn request(lines: &str) -> Message {
        Message::new(MessageKind::CommandReq, lines.to_string())
    }

    #[test]
    fn test_command_batch_gets_response() {
        let (mut handler, mut socket) = setup();
        deliver(&mut handler, &socket, request("set a 1\nadd a 2\nget a"));

        let resp = socket.reader.read_message().unwrap();
        assert_eq!(resp.kind, MessageKind::CommandResp);
        assert_eq!(resp.payload_lines(), vec!["OK", "3", "3"]);
        assert!(handler.is_running());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let (mut handler, mut socket) = setup();
        deliver(&mut handler, &socket, request("echo fine\nnope"));

        let resp = socket.reader.read_message().unwrap();
        assert_eq!(resp.kind, MessageKind::CommandResp);
        assert_eq!(resp.text(), "error: line 2: unknown command 'nope'");
        assert!(handler.runner().is_idle());
    }

    #[test]
    fn test_script_round_trip() {
        let (mut handler, mut socket) = setup();
        deliver(
            &mut handler,
            &socket,
            request("echo a\nexecute_script setup\necho c"),
        );

        // Output is held back until the whole request is done
        let req = socket.reader.read_message().unwrap();
        assert_eq!(req.kind, MessageKind::ScriptReq);
        assert_eq!(req.payload_lines(), vec!["setup"]);
        assert_eq!(socket.reader.read_message(), Err(FrameError::Empty));

        let body = Message::new(MessageKind::ScriptResp, "setup\n# comment\necho x1\n");
        deliver(&mut handler, &socket, body);

        let resp = socket.reader.read_message().unwrap();
        assert_eq!(resp.kind, MessageKind::CommandResp);
        assert_eq!(resp.payload_lines(), vec!["a", "x1", "c"]);
        assert!(handler.runner().is_idle());
    }

    #[test]
    fn test_recursive_script_is_reported() {
        let (mut handler, mut socket) = setup();
        deliver(&mut handler, &socket, request("execute_script loop"));
        let req = socket.reader.read_message().unwrap();
        assert_eq!(req.kind, MessageKind::ScriptReq);

        let body = "loop\necho again\nexecute_script loop";
        deliver(&mut handler, &socket, Message::new(MessageKind::ScriptResp, body));
        let req = socket.reader.read_message().unwrap();
        assert_eq!(req.kind, MessageKind::ScriptReq);

        deliver(&mut handler, &socket, Message::new(MessageKind::ScriptResp, body));
        let resp = socket.reader.read_message().unwrap();
        let lines = resp.payload_lines();
        assert_eq!(lines[0], "again");
        assert!(lines[1].starts_with("error: recursion detected"));
        assert!(handler.runner().is_idle());
        assert!(handler.is_running());
    }

    #[test]
    fn test_exit_responds_then_closes() {
        let (mut handler, mut socket) = setup();
        deliver(&mut handler, &socket, request("echo last words\nexit\necho never"));

        let resp = socket.reader.read_message().unwrap();
        assert_eq!(resp.payload_lines(), vec!["last words", "bye"]);
        assert_eq!(socket.reader.read_message().unwrap(), Message::close());
        assert!(!handler.is_running());
        assert!(!handler.endpoints()[0].wanted);
    }

    #[test]
    fn test_close_from_socket_stops_handler() {
        let (mut handler, mut socket) = setup();
        deliver(&mut handler, &socket, Message::close());

        assert!(!handler.is_running());
        assert_eq!(socket.reader.read_message(), Err(FrameError::Empty));
    }

    #[test]
    fn test_closed_relay_stops_handler() {
        let (mut handler, socket) = setup();
        drop(socket);

        let endpoint = handler.relay.reader.id();
        handler.process(Role::NetworkLink, endpoint);
        assert_eq!(handler.state(), ComState::Idle);
        assert!(!handler.is_running());
    }

    #[test]
    fn test_missing_script_clears_pending_batch() {
        let (mut handler, mut socket) = setup();
        deliver(&mut handler, &socket, request("execute_script ghost\necho after"));
        assert_eq!(socket.reader.read_message().unwrap().kind, MessageKind::ScriptReq);

        deliver(&mut handler, &socket, Message::new(MessageKind::ScriptResp, "ghost\n"));
        let resp = socket.reader.read_message().unwrap();
        assert_eq!(resp.text(), "error: script 'ghost' is missing or empty");
        assert!(handler.runner().is_idle());
    }
}
