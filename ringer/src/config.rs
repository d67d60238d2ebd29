//! Runtime configuration for one ring worker.

use std::path::PathBuf;
use std::time::Duration;

use crate::connection::ConnectionConfig;

pub const DEFAULT_BASE_PORT: u16 = 12300;
pub const DEFAULT_REPLICAS: usize = 3;
pub const DEFAULT_CACHE_SIZE: usize = 100_000;

/// Everything a worker needs to join the ring.
///
/// Built from the command line by [`crate::cli::Cli::ring_config`]; tests
/// construct it directly.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Workers launched on this host; siblings listen on consecutive ports.
    pub process_count: usize,
    pub worker_index: usize,
    pub replicas: usize,
    pub cache_size: usize,
    /// Parent of the per-worker store directories; `None` keeps values in memory.
    pub data_dir: Option<PathBuf>,
    /// Host this worker advertises and binds.
    pub host: String,
    pub base_port: u16,
    pub host_pattern: Option<String>,
    /// Extra `host:port` seeds.
    pub peers: Vec<String>,
    /// Do not seed sibling workers on this host.
    pub client_only: bool,
    pub gossip_interval: Duration,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub unresolved_delay: Duration,
}

/// Port of worker `index`, or `None` past the end of the port range.
pub fn worker_port(base_port: u16, index: usize) -> Option<u16> {
    u16::try_from(index).ok()?.checked_add(base_port)
}

impl RingConfig {
    /// Member port of this worker; `None` when it would overflow.
    pub fn port(&self) -> Option<u16> {
        worker_port(self.base_port, self.worker_index)
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay: self.reconnect_delay,
            unresolved_delay: self.unresolved_delay,
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            process_count: 1,
            worker_index: 0,
            replicas: DEFAULT_REPLICAS,
            cache_size: DEFAULT_CACHE_SIZE,
            data_dir: None,
            host: "localhost".to_string(),
            base_port: DEFAULT_BASE_PORT,
            host_pattern: None,
            peers: Vec::new(),
            client_only: false,
            gossip_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(100),
            unresolved_delay: Duration::from_secs(100),
        }
    }
}
