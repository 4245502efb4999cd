//! Relay - Reactor-Driven Command Execution over UDP
//!
//! Entry point for both halves: `relay server` runs the command server,
//! `relay client` runs an interactive shell connected to one.

use relay::config::{ClientConfig, ServerConfig};
use relay::{Client, Server};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// What the binary was asked to run
enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Walks the arguments after the subcommand.
struct Args {
    args: Vec<String>,
    pos: usize,
}

impl Args {
    fn next_flag(&mut self) -> Option<String> {
        let flag = self.args.get(self.pos).cloned();
        self.pos += 1;
        flag
    }

    fn value(&mut self, flag: &str) -> String {
        match self.args.get(self.pos) {
            Some(value) => {
                self.pos += 1;
                value.clone()
            }
            None => fail(&format!("{} requires a value", flag)),
        }
    }

    fn number<T: std::str::FromStr>(&mut self, flag: &str) -> T {
        let raw = self.value(flag);
        raw.parse()
            .unwrap_or_else(|_| fail(&format!("invalid value for {}: {}", flag, raw)))
    }

    fn millis(&mut self, flag: &str) -> Duration {
        Duration::from_millis(self.number(flag))
    }
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

impl Mode {
    /// Parse the mode and its settings from command-line arguments
    fn from_args() -> Self {
        let mut args = Args {
            args: std::env::args().collect(),
            pos: 1,
        };

        match args.next_flag().as_deref() {
            Some("server") => Mode::Server(server_args(&mut args)),
            Some("client") => Mode::Client(client_args(&mut args)),
            Some("--help") | Some("-h") => {
                print_help();
                std::process::exit(0);
            }
            Some("--version") | Some("-v") => {
                println!("relay version {}", relay::VERSION);
                std::process::exit(0);
            }
            Some(other) => {
                eprintln!("Unknown command: {}", other);
                print_help();
                std::process::exit(1);
            }
            None => {
                print_help();
                std::process::exit(1);
            }
        }
    }
}

fn server_args(args: &mut Args) -> ServerConfig {
    let mut config = ServerConfig::default();
    while let Some(flag) = args.next_flag() {
        match flag.as_str() {
            "--host" => config.host = args.value(&flag),
            "--port" | "-p" => config.port = args.number(&flag),
            "--workers" | "-w" => config.workers = args.number(&flag),
            "--timeout-ms" => config.disconnection_delay = args.millis(&flag),
            "--token" => config.credential = Some(args.value(&flag)),
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", flag);
                print_help();
                std::process::exit(1);
            }
        }
    }
    if config.workers == 0 {
        fail("--workers must be at least 1");
    }
    config
}

fn client_args(args: &mut Args) -> ClientConfig {
    let mut config = ClientConfig::default();
    while let Some(flag) = args.next_flag() {
        match flag.as_str() {
            "--server" | "-s" => config.server = args.value(&flag),
            "--workers" | "-w" => config.workers = args.number(&flag),
            "--ping-ms" => config.ping_interval = args.millis(&flag),
            "--scripts" => config.script_dir = PathBuf::from(args.value(&flag)),
            "--token" => config.credential = Some(args.value(&flag)),
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", flag);
                print_help();
                std::process::exit(1);
            }
        }
    }
    if config.workers == 0 {
        fail("--workers must be at least 1");
    }
    config
}

fn print_help() {
    println!(
        r#"
Relay - Reactor-Driven Command Execution over UDP

USAGE:
    relay server [OPTIONS]
    relay client [OPTIONS]

SERVER OPTIONS:
        --host <HOST>        Host to bind to (default: {host})
    -p, --port <PORT>        UDP port to listen on (default: {port})
    -w, --workers <N>        Dispatch workers (default: 4)
        --timeout-ms <MS>    Idle time before a peer is dropped (default: 1000)
        --token <TOKEN>      Token clients must present

CLIENT OPTIONS:
    -s, --server <ADDR>      Server address (default: {host}:{port})
    -w, --workers <N>        Dispatch workers (default: 2)
        --ping-ms <MS>       Keepalive interval (default: 300)
        --scripts <DIR>      Directory execute_script reads from (default: .)
        --token <TOKEN>      Token to present to the server

GLOBAL:
    -v, --version            Print version information
    -h, --help               Print this help message

LOGGING:
    Set RUST_LOG to change verbosity, e.g. RUST_LOG=relay=debug

EXAMPLES:
    relay server                           # Listen on {host}:{port}
    relay server --port 9000 --token s3    # Require a token
    relay client --scripts ./scripts       # Connect to the local server
    > set answer 42
    OK
    > execute_script setup
"#,
        host = relay::DEFAULT_HOST,
        port = relay::DEFAULT_PORT,
    );
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
Relay v{} - Reactor-Driven Command Execution over UDP
──────────────────────────────────────────────────────────────
Server listening on {} (idle timeout {} ms)

Use Ctrl+C to shutdown gracefully.
"#,
        relay::VERSION,
        config.bind_address(),
        config.disconnection_delay.as_millis()
    );
}

fn main() -> anyhow::Result<()> {
    let mode = Mode::from_args();

    // Set up logging, RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match mode {
        Mode::Server(config) => {
            print_banner(&config);
            let server = Server::bind(&config)?;
            let handle = server.handle();
            server.on_ctrl_c(move || {
                info!("Shutdown signal received, stopping server...");
                handle.stop();
            });
            server.run()?;
            info!("Server shutdown complete");
        }
        Mode::Client(config) => {
            let client = Client::new(&config)?;
            let handle = client.handle();
            client.on_ctrl_c(move || handle.stop());
            info!(server = %client.server(), "Connected");
            client.run()?;
        }
    }

    Ok(())
}
