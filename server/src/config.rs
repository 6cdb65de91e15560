//! Runtime settings for the relay server.

use relay_shared::DEFAULT_PORT;
use std::path::PathBuf;
use std::time::Duration;

/// Every tunable the server reads. `main` builds one from command-line
/// arguments; tests start from `Default` and shrink the timers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Where the counters snapshot is read from and written to
    pub stats_path: PathBuf,
    /// Rooms idle longer than this are evicted by the sweeper
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Clients silent for longer than this receive a keep-alive
    pub heartbeat_after: Duration,
    pub stats_interval: Duration,
    /// How long a disconnected session stays in its room
    pub session_grace: Duration,
    pub write_timeout: Duration,
    pub quiet: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            stats_path: PathBuf::from("stats.json"),
            inactivity_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_after: Duration::from_secs(30),
            stats_interval: Duration::from_secs(25),
            session_grace: Duration::from_secs(5 * 60),
            write_timeout: Duration::from_secs(10),
            quiet: false,
        }
    }
}
