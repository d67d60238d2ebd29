//! Launches one worker process per slot on this host.
//!
//! Each worker is this same executable re-run with the original arguments
//! plus `--worker-index <i>`, so it listens on `base_port + i` and seeds its
//! siblings. Workers are not restarted when they exit.

use std::ffi::OsString;
use std::process::ExitStatus;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::process::Command;
use tokio::select;
use tracing::{info, warn};

/// Arguments for worker `index`: everything the supervisor was given, plus
/// the index.
pub fn worker_args<I>(args: I, index: usize) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args: Vec<OsString> = args.into_iter().collect();
    args.push("--worker-index".into());
    args.push(index.to_string().into());
    args
}

/// Spawns `process_count` workers and waits until all of them exit, or
/// until Ctrl+C, in which case the workers are killed.
pub async fn run(process_count: usize) -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate the ringer executable")?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    let mut workers = Vec::with_capacity(process_count);
    for index in 0..process_count {
        let child = Command::new(&exe)
            .args(worker_args(args.iter().cloned(), index))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch worker {index}"))?;
        info!(index, pid = child.id(), "launched worker");
        workers.push(child);
    }

    select! {
        statuses = join_all(workers.iter_mut().map(|worker| worker.wait())) => {
            for (index, status) in statuses.into_iter().enumerate() {
                report_exit(index, status);
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, stopping workers");
        }
    }

    for (index, worker) in workers.iter_mut().enumerate() {
        if let Err(err) = worker.kill().await {
            warn!(index, error = %err, "failed to stop worker");
        }
    }
    Ok(())
}

fn report_exit(index: usize, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) if status.success() => info!(index, "worker exited"),
        Ok(status) => warn!(index, %status, "worker exited with failure"),
        Err(err) => warn!(index, error = %err, "failed to wait for worker"),
    }
}
