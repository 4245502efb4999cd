//! Client Socket Handler
//!
//! Bridges the shell and the server: requests from the shell go out as
//! `Packet` envelopes, packets from the server come back to the shell
//! unwrapped, and a keepalive ticker turns into `Ping`s so the server keeps
//! the session open while the user is idle.

use crate::protocol::{FrameError, Message, MessageKind};
use crate::reactor::{
    drive, pipe, EndpointId, Handler, HandlerError, Machine, NetworkEndpoint, PipeReader,
    RelayPair, Role, Subscription,
};
use crate::session::{Ticker, Timers};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// States of a [`ClientSocketHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    NewEvent,
    NewNetworkEvent,
    NewComEvent,
    KeepAlive,
    Error,
}

/// Owns the client socket.
pub struct ClientSocketHandler {
    state: ClientState,
    network: NetworkEndpoint,
    server: SocketAddr,
    credential: Option<String>,
    relay: RelayPair,
    ticks: PipeReader,
    _keepalive: Ticker,
    running: bool,
    event: Option<Role>,
}

impl ClientSocketHandler {
    /// `relay` is the socket side of the relay to the shell. Pings go out
    /// every `ping_interval`.
    pub fn new(
        network: NetworkEndpoint,
        server: SocketAddr,
        credential: Option<String>,
        relay: RelayPair,
        timers: &Timers,
        ping_interval: Duration,
    ) -> io::Result<Self> {
        let (tick_tx, ticks) = pipe(Role::InternalLink)?;
        let keepalive = timers.every(ping_interval, tick_tx, Message::empty(MessageKind::Tick));

        Ok(Self {
            state: ClientState::Idle,
            network,
            server,
            credential,
            relay,
            ticks,
            _keepalive: keepalive,
            running: true,
            event: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn send_to_server(&self, message: Message) -> Result<(), HandlerError> {
        let envelope = match message.kind {
            MessageKind::Ping | MessageKind::Close => message,
            _ => message.into_packet(),
        };
        let envelope = envelope.with_credential(self.credential.clone());
        self.network.send(&envelope, self.server)?;
        Ok(())
    }

    fn on_new_event(&mut self) -> Result<ClientState, HandlerError> {
        let role = self.event.ok_or(HandlerError::MissingEvent("NewEvent"))?;
        let next = match role {
            Role::NetworkLink => ClientState::NewNetworkEvent,
            Role::ComLink => ClientState::NewComEvent,
            Role::InternalLink => ClientState::KeepAlive,
            Role::ShellLink => {
                warn!(role = %role, "Unexpected event role");
                ClientState::Idle
            }
        };
        Ok(next)
    }

    fn on_new_network_event(&mut self) -> Result<ClientState, HandlerError> {
        let (source, decoded) = match self.network.receive() {
            Ok(pair) => pair,
            Err(FrameError::Empty) => return Ok(ClientState::Idle),
            Err(e) => return Err(e.into()),
        };

        if source != self.server {
            debug!(source = %source, "Ignoring datagram from a stranger");
            return Ok(ClientState::Idle);
        }

        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed datagram");
                return Ok(ClientState::Idle);
            }
        };

        match envelope.kind {
            MessageKind::Packet => match envelope.unwrap_packet() {
                Ok(inner) => {
                    trace!(kind = %inner.kind, "Forwarding to shell");
                    self.relay.writer.write_message(&inner)?;
                }
                Err(e) => warn!(error = %e, "Dropping malformed packet"),
            },
            MessageKind::Close => {
                info!(server = %self.server, "Server closed the session");
                self.relay.writer.write_message(&Message::close())?;
                self.running = false;
            }
            MessageKind::Ping => {}
            other => warn!(kind = %other, "Ignoring unexpected envelope"),
        }
        Ok(ClientState::Idle)
    }

    fn on_new_com_event(&mut self) -> Result<ClientState, HandlerError> {
        match self.relay.reader.read_message() {
            Ok(message) => {
                let closing = message.kind == MessageKind::Close;
                self.send_to_server(message)?;
                if closing {
                    self.running = false;
                }
                Ok(ClientState::Idle)
            }
            Err(FrameError::Empty) => Ok(ClientState::Idle),
            Err(FrameError::Closed) => {
                debug!("Shell relay closed");
                self.running = false;
                Ok(ClientState::Idle)
            }
            Err(e) if e.is_protocol() => {
                warn!(error = %e, "Ignoring malformed shell message");
                Ok(ClientState::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_keep_alive(&mut self) -> Result<ClientState, HandlerError> {
        match self.ticks.read_message() {
            Ok(_) => {
                trace!(server = %self.server, "Keepalive");
                self.send_to_server(Message::ping())?;
                Ok(ClientState::Idle)
            }
            Err(FrameError::Empty) => Ok(ClientState::Idle),
            Err(e) => Err(e.into()),
        }
    }
}

impl Machine for ClientSocketHandler {
    type State = ClientState;

    const IDLE: ClientState = ClientState::Idle;
    const ERROR: ClientState = ClientState::Error;

    fn state(&self) -> ClientState {
        self.state
    }

    fn set_state(&mut self, state: ClientState) {
        self.state = state;
    }

    fn step(&mut self, state: ClientState) -> Result<ClientState, HandlerError> {
        match state {
            ClientState::NewEvent => self.on_new_event(),
            ClientState::NewNetworkEvent => self.on_new_network_event(),
            ClientState::NewComEvent => self.on_new_com_event(),
            ClientState::KeepAlive => self.on_keep_alive(),
            ClientState::Idle | ClientState::Error => Ok(ClientState::Idle),
        }
    }
}

impl Handler for ClientSocketHandler {
    fn name(&self) -> &str {
        "client-socket"
    }

    fn process(&mut self, role: Role, _endpoint: EndpointId) {
        self.event = Some(role);
        self.state = ClientState::NewEvent;
        drive(self);
        self.event = None;
    }

    fn endpoints(&self) -> Vec<Subscription> {
        vec![
            self.network.subscription(self.running),
            self.relay.reader.subscription(self.running),
            self.ticks.subscription(self.running),
        ]
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
