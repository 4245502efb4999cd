//! Client Module
//!
//! A UDP client with two handlers on one reactor: the socket handler talking
//! to the server and the shell handler talking to the user.
//!
//! ```text
//! ┌────────────┐  relay  ┌─────────────────────┐  UDP  ┌────────┐
//! │ ShellHandler│<──────>│ ClientSocketHandler │<─────>│ server │
//! └────────────┘         └─────────────────────┘       └────────┘
//!       ▲                          ▲
//!   stdin pump               keepalive ticker
//! ```

pub mod shell;
pub mod socket;

pub use shell::{spawn_line_pump, ShellHandler, ShellState};
pub use socket::{ClientSocketHandler, ClientState};

use crate::config::ClientConfig;
use crate::reactor::{
    pipe, relay_pair, NetworkEndpoint, Reactor, ReactorError, ReactorHandle, Role,
};
use crate::session::{TimerConfig, TimerService};
use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread::JoinHandle;
use tracing::info;

/// Errors raised while starting or running the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("cannot resolve address '{0}'")]
    BadAddress(String),
}

/// A connected, not yet running client.
pub struct Client {
    reactor: Reactor,
    timers: TimerService,
    server: SocketAddr,
    pump: JoinHandle<()>,
}

fn resolve(address: &str) -> Result<SocketAddr, ClientError> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ClientError::BadAddress(address.to_string()))
}

/// Resolves the server, preferring an address the local socket can reach.
fn resolve_server(address: &str, local: &SocketAddr) -> Result<SocketAddr, ClientError> {
    same_family(address.to_socket_addrs()?, local)
        .ok_or_else(|| ClientError::BadAddress(address.to_string()))
}

/// First candidate in the local address's family, else the first one.
fn same_family(
    candidates: impl IntoIterator<Item = SocketAddr>,
    local: &SocketAddr,
) -> Option<SocketAddr> {
    let mut first = None;
    for candidate in candidates {
        if candidate.is_ipv4() == local.is_ipv4() {
            return Some(candidate);
        }
        first.get_or_insert(candidate);
    }
    first
}

impl Client {
    /// Builds a client reading lines from stdin and printing to stdout.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let stdin = io::BufReader::new(io::stdin());
        Self::with_io(config, stdin, Box::new(io::stdout()))
    }

    /// Builds a client over arbitrary input and output.
    pub fn with_io<R>(
        config: &ClientConfig,
        input: R,
        output: Box<dyn Write + Send>,
    ) -> Result<Self, ClientError>
    where
        R: BufRead + Send + 'static,
    {
        let local = resolve(&config.bind)?;
        let server = resolve_server(&config.server, &local)?;

        let mut reactor = Reactor::new(config.reactor())?;
        let timers = TimerService::new(TimerConfig::default())?;
        let network = NetworkEndpoint::bind(local)?;

        let (socket_side, shell_side) = relay_pair(Role::ComLink, Role::ComLink)?;
        let socket = ClientSocketHandler::new(
            network,
            server,
            config.credential.clone(),
            socket_side,
            &timers.timers(),
            config.ping_interval,
        )?;

        let (lines_tx, lines_rx) = pipe(Role::ShellLink)?;
        let shell = ShellHandler::new(
            lines_rx,
            shell_side,
            config.script_dir.clone(),
            output,
            reactor.handle(),
        );

        reactor.register(Box::new(socket));
        reactor.register(Box::new(shell));
        let pump = spawn_line_pump(input, lines_tx)?;

        info!(server = %server, "Client ready");
        Ok(Self {
            reactor,
            timers,
            server,
            pump,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// Runs `on_signal` when Ctrl+C is received.
    pub fn on_ctrl_c<F>(&self, on_signal: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.timers.on_ctrl_c(on_signal);
    }

    /// Runs until the session ends or the reactor is stopped.
    pub fn run(mut self) -> Result<(), ClientError> {
        self.reactor.run()?;
        // The pump may still block on input; it is detached
        drop(self.pump);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use std::fs;
    use std::io::Cursor;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn start_server() -> (SocketAddr, ReactorHandle, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let config = ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                ..ServerConfig::default()
            };
            let server = Server::bind(&config).unwrap();
            tx.send((server.local_addr(), server.handle())).unwrap();
            server.run().unwrap();
        });
        let (addr, handle) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        (addr, handle, thread)
    }

    fn run_client(config: ClientConfig, input: &'static str) -> String {
        let out = SharedBuf::default();
        let client = Client::with_io(&config, Cursor::new(input), Box::new(out.clone())).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            client.run().unwrap();
            done_tx.send(()).unwrap();
        });
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("client never finished");

        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_server_address_matches_bind_family() {
        let v6: SocketAddr = "[::1]:7878".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:7878".parse().unwrap();

        let any_v4: SocketAddr = "0.0.0.0:0".parse().unwrap();
        assert_eq!(same_family([v6, v4], &any_v4), Some(v4));

        let any_v6: SocketAddr = "[::]:0".parse().unwrap();
        assert_eq!(same_family([v4, v6], &any_v6), Some(v6));

        // Nothing matches, fall back to the first candidate
        assert_eq!(same_family([v6], &any_v4), Some(v6));
        assert_eq!(same_family(Vec::<SocketAddr>::new(), &any_v4), None);

        assert_eq!(resolve_server("127.0.0.1:9000", &any_v4).unwrap().port(), 9000);
    }

    #[test]
    fn test_session_runs_until_exit() {
        let (addr, server, thread) = start_server();
        let config = ClientConfig {
            server: addr.to_string(),
            bind: "127.0.0.1:0".to_string(),
            ..ClientConfig::default()
        };

        let output = run_client(config, "set color blue\nget color\n");
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["OK", "blue", "bye", "Connection closed."]);

        server.stop();
        thread.join().unwrap();
    }

    #[test]
    fn test_execute_script_reads_local_file() {
        let dir = std::env::temp_dir().join(format!("relay-client-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("fill"), "# fill the store\nset x 10\nadd x 5\n").unwrap();

        let (addr, server, thread) = start_server();
        let config = ClientConfig {
            server: addr.to_string(),
            bind: "127.0.0.1:0".to_string(),
            script_dir: dir.clone(),
            ..ClientConfig::default()
        };

        let output = run_client(config, "execute_script fill\nget x\n");
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["OK", "15", "15", "bye", "Connection closed."]);

        server.stop();
        thread.join().unwrap();
        fs::remove_dir_all(dir).unwrap();
    }
}
