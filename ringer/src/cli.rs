use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use sysinfo::System;

use crate::config::{DEFAULT_BASE_PORT, DEFAULT_CACHE_SIZE, DEFAULT_REPLICAS, RingConfig, worker_port};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Self-organizing ring of replicated key-value workers", long_about = None)]
pub struct Cli {
    /// Worker processes to run on this host, one per port from --base-port.
    #[arg(long, default_value_t = 1)]
    pub processes: usize,

    /// Index of this worker; set by the supervisor when it launches workers.
    #[arg(long, hide = true)]
    pub worker_index: Option<usize>,

    /// Number of distinct members that hold each key.
    #[arg(long, default_value_t = DEFAULT_REPLICAS)]
    pub replicas: usize,

    /// Entries kept in the in-memory LRU cache; 0 disables it.
    #[arg(long, default_value_t = DEFAULT_CACHE_SIZE)]
    pub cache_size: usize,

    /// Directory for the per-worker stores; values stay in memory without it.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Host name this worker advertises to peers. Defaults to the machine's hostname.
    #[arg(long)]
    pub host: Option<String>,

    /// Port of worker 0; worker i listens on base-port + i.
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// Pattern of other ring hosts, e.g. "ring-(0-3).internal".
    #[arg(long)]
    pub host_pattern: Option<String>,

    /// Additional seed member as host:port. Repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Do not seed the sibling workers on this host.
    #[arg(long)]
    pub client_only: bool,

    #[arg(long, default_value_t = 500)]
    pub gossip_interval_ms: u64,

    #[arg(long, default_value_t = 1000)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 5000)]
    pub request_timeout_ms: u64,

    #[arg(long, default_value_t = 100)]
    pub reconnect_delay_ms: u64,

    /// Backoff before retrying a host that did not resolve.
    #[arg(long, default_value_t = 100_000)]
    pub unresolved_delay_ms: u64,

    /// Admin HTTP port of worker 0; worker i serves on http-port + i.
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Append logs to this file instead of stdout.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Read GET/SET/STATUS commands from stdin.
    #[arg(long)]
    pub console: bool,
}

impl Cli {
    /// True for the process that should launch workers instead of joining.
    pub fn is_supervisor(&self) -> bool {
        self.processes > 1 && self.worker_index.is_none()
    }

    pub fn ring_config(&self) -> RingConfig {
        RingConfig {
            process_count: self.processes.max(1),
            worker_index: self.worker_index.unwrap_or(0),
            replicas: self.replicas,
            cache_size: self.cache_size,
            data_dir: self.data_dir.clone(),
            host: self.host.clone().unwrap_or_else(local_hostname),
            base_port: self.base_port,
            host_pattern: self.host_pattern.clone(),
            peers: self.peers.clone(),
            client_only: self.client_only,
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            unresolved_delay: Duration::from_millis(self.unresolved_delay_ms),
        }
    }

    /// Admin port for this worker, if the admin endpoint is enabled.
    pub fn admin_port(&self) -> Result<Option<u16>> {
        let Some(base) = self.http_port else {
            return Ok(None);
        };
        let index = self.worker_index.unwrap_or(0);
        worker_port(base, index)
            .map(Some)
            .ok_or_else(|| anyhow!("worker {index} has no admin port above {base}"))
    }
}

fn local_hostname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}
