use std::path::PathBuf;
use std::time::Duration;

/// Default size of one scraped block (and of each pod's shared page).
///
/// 4096 is a better choice for page alignment; 1024 matches the historical
/// default of the reference deployment.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Hard cap on the number of connections a collector process accepts over
/// its lifetime. Logical indices are never reused, so this also bounds the
/// number of per-connection sample files.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// How often the agent's liveness watcher sweeps registered pods.
pub const WATCHER_PERIOD: Duration = Duration::from_secs(2);

/// Timeout for CM address and route resolution.
pub const RESOLVE_TIMEOUT_MS: i32 = 500;

/// Sidecar file the agent writes its registration port to, in its working
/// directory, so pods on the same host can find it without env vars.
pub const PORT_FILE: &str = ".port";

/// Host-agent runtime configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Collector address (IP or hostname).
    pub peer_addr: String,

    /// Collector CM listening port.
    pub peer_port: u16,

    /// Size of each pod's shared page, in bytes.
    pub block_size: usize,

    /// Number of READ-sink regions the collector keeps per pod. The agent
    /// only needs this to size its QPs consistently with the peer.
    pub mrs_per_pod: usize,

    /// TCP registration port. 0 picks an ephemeral port; the chosen port is
    /// always written to the `.port` sidecar file.
    pub listen_port: u16,

    /// Directory for the `.port` sidecar file.
    pub work_dir: PathBuf,

    /// Whether `shm_unlink` failures at teardown are logged and swallowed
    /// (true) or propagated out of the session (false).
    pub ignore_unlink_errors: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            peer_addr: "127.0.0.1".to_owned(),
            peer_port: 20079,
            block_size: DEFAULT_BLOCK_SIZE,
            mrs_per_pod: 1,
            listen_port: 0,
            work_dir: PathBuf::from("."),
            ignore_unlink_errors: true,
        }
    }
}

/// Collector runtime configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// CM listening port.
    pub listen_port: u16,

    /// Scrape period. Whole seconds are sufficient.
    pub sampling_interval: Duration,

    /// Size of each READ, in bytes. Must match the agent's block size.
    pub block_size: usize,

    /// Number of READs per batch (one per sink buffer).
    pub mrs_per_pod: usize,

    /// Maximum number of connections accepted over the process lifetime.
    pub max_connections: usize,

    /// Directory for latency sample files.
    pub output_dir: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_port: 20079,
            sampling_interval: Duration::from_secs(1),
            block_size: DEFAULT_BLOCK_SIZE,
            mrs_per_pod: 1,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            output_dir: PathBuf::from("."),
        }
    }
}
