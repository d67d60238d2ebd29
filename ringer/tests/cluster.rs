//! Several ring workers in one process, talking over loopback TCP.
//!
//! Each test owns a fixed port range because sibling workers find each
//! other at `base_port + index`.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, bail};
use ringer::{
    config::RingConfig,
    member::Status,
    runtime::{RingHandle, spawn_ring},
};
use tokio::time::{Instant, sleep};

fn worker_config(base_port: u16, process_count: usize, worker_index: usize) -> RingConfig {
    RingConfig {
        process_count,
        worker_index,
        replicas: 2,
        host: "127.0.0.1".into(),
        base_port,
        gossip_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_millis(50),
        ..RingConfig::default()
    }
}

async fn spawn_workers(base_port: u16, count: usize) -> Result<Vec<RingHandle>> {
    let mut workers = Vec::with_capacity(count);
    for index in 0..count {
        workers.push(spawn_ring(worker_config(base_port, count, index)).await?);
    }
    Ok(workers)
}

/// Polls `check` until it holds or `limit` passes.
async fn eventually<F, Fut>(limit: Duration, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        sleep(Duration::from_millis(25)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Every worker is stable and sees `expected` up members.
async fn converged(workers: &[RingHandle], expected: usize) -> bool {
    for worker in workers {
        match worker.status().await {
            Ok(status) if status.is_stable && status.active.len() == expected => {}
            _ => return false,
        }
    }
    true
}

async fn shutdown_all(workers: &[RingHandle]) {
    for worker in workers {
        let _ = worker.shutdown().await;
    }
}

#[tokio::test]
async fn sibling_workers_converge_and_replicate() -> Result<()> {
    let workers = spawn_workers(23400, 3).await?;
    eventually(Duration::from_secs(10), "three active members", || {
        converged(&workers, 3)
    })
    .await?;

    // Every worker derives the same placement.
    let targets = workers[0].targets("apple").await?;
    assert_eq!(targets.len(), 2);
    assert_ne!(targets[0], targets[1]);
    for worker in &workers[1..] {
        assert_eq!(worker.targets("apple").await?, targets);
    }

    // A single leader, agreed on by everyone.
    let leader = workers[0].status().await?.leader;
    assert!(leader.is_some());
    for worker in &workers[1..] {
        assert_eq!(worker.status().await?.leader, leader);
    }

    let report = workers[0].set("apple", "red").await?;
    assert!(report.is_complete());
    assert_eq!(report.acked.len(), 2);
    for target in &targets {
        assert!(report.acked.contains(target));
    }

    for worker in &workers {
        assert_eq!(worker.get("apple").await, Ok(Some("red".to_string())));
    }

    shutdown_all(&workers).await;
    Ok(())
}

#[tokio::test]
async fn explicit_peers_chain_into_one_ring() -> Result<()> {
    let standalone = |port: u16, peers: Vec<String>| RingConfig {
        client_only: true,
        peers,
        ..worker_config(port, 1, 0)
    };

    let a = spawn_ring(standalone(23500, vec![])).await?;
    let b = spawn_ring(standalone(23510, vec!["127.0.0.1:23500".into()])).await?;
    let c = spawn_ring(standalone(23520, vec!["127.0.0.1:23510".into()])).await?;
    let workers = [a, b, c];

    eventually(Duration::from_secs(10), "the chain to merge", || {
        converged(&workers, 3)
    })
    .await?;

    for worker in &workers {
        let roster = worker.roster().await?;
        for name in ["127.0.0.1:23500", "127.0.0.1:23510", "127.0.0.1:23520"] {
            assert_eq!(roster.get(name), Some(&Status::Up), "{} sees {name}", worker.name());
        }
    }

    shutdown_all(&workers).await;
    Ok(())
}

#[tokio::test]
async fn stopped_worker_is_marked_down() -> Result<()> {
    let workers = spawn_workers(23600, 2).await?;
    eventually(Duration::from_secs(10), "two active members", || {
        converged(&workers, 2)
    })
    .await?;

    let stopped = workers[1].name().to_string();
    workers[1].shutdown().await?;

    let survivor = &workers[0];
    let stopped_name = stopped.as_str();
    eventually(Duration::from_secs(5), "the stopped worker to go down", move || async move {
        survivor
            .status()
            .await
            .ok()
            .and_then(|status| status.member(stopped_name).map(|member| member.status))
            == Some(Status::Down)
    })
    .await?;

    // The survivor keeps serving on its own.
    let status = workers[0].status().await?;
    assert_eq!(status.active, vec![workers[0].name().to_string()]);
    let report = workers[0].set("pear", "green").await?;
    assert_eq!(report.acked, vec![workers[0].name().to_string()]);
    assert_eq!(workers[0].get("pear").await, Ok(Some("green".to_string())));

    workers[0].shutdown().await?;
    Ok(())
}
