//! Configuration
//!
//! Plain settings structs for the two halves of the binary. Defaults live
//! here; the binary overrides them from the command line.

use crate::reactor::{ReactorConfig, DEFAULT_WORKERS};
use crate::session::{TimerConfig, DISCONNECTION_DELAY};
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;
use std::time::Duration;

/// Default interval between client keepalive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(300);

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// UDP port to listen on
    pub port: u16,
    /// Dispatch workers
    pub workers: usize,
    /// Idle time before a peer is disconnected
    pub disconnection_delay: Duration,
    /// Token clients must present, if any
    pub credential: Option<String>,
    /// Threads for the timer runtime
    pub timer_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            disconnection_delay: DISCONNECTION_DELAY,
            credential: None,
            timer_threads: 1,
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reactor(&self) -> ReactorConfig {
        ReactorConfig {
            workers: self.workers,
            ..ReactorConfig::default()
        }
    }

    pub fn timers(&self) -> TimerConfig {
        TimerConfig {
            threads: self.timer_threads,
        }
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address as `host:port`
    pub server: String,
    /// Local address to bind the client socket to
    pub bind: String,
    /// Dispatch workers
    pub workers: usize,
    /// Interval between keepalive pings; keep it well under the server's
    /// disconnection delay
    pub ping_interval: Duration,
    /// Directory `execute_script` names are resolved against
    pub script_dir: PathBuf,
    /// Token attached to every request, if any
    pub credential: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            bind: "0.0.0.0:0".to_string(),
            workers: 2,
            ping_interval: DEFAULT_PING_INTERVAL,
            script_dir: PathBuf::from("."),
            credential: None,
        }
    }
}

impl ClientConfig {
    pub fn reactor(&self) -> ReactorConfig {
        ReactorConfig {
            workers: self.workers,
            ..ReactorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        assert_eq!(config.disconnection_delay, Duration::from_millis(1000));
        assert_eq!(config.reactor().workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_ping_interval_beats_disconnection() {
        assert!(ClientConfig::default().ping_interval < ServerConfig::default().disconnection_delay);
    }
}
