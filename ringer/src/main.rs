use std::fs::OpenOptions;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{BufReader, stdin, stdout};
use tokio::net::TcpListener;
use tokio::select;
use tracing::{info, warn};

use ringer::{admin, cli::Cli, console, runtime::spawn_ring, supervisor};

fn init_tracing(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .with_context(|| format!("invalid log level {:?}", cli.log_level))?;
    let builder = fmt().with_env_filter(filter).with_target(false);

    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let _ = builder.with_ansi(false).with_writer(Mutex::new(file)).try_init();
        }
        None => {
            let _ = builder.try_init();
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    let result = runtime.block_on(run(cli));
    // A console may still be parked on a stdin read.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli) -> Result<()> {
    if cli.is_supervisor() {
        info!(processes = cli.processes, "supervising workers");
        return supervisor::run(cli.processes).await;
    }

    let config = cli.ring_config();
    let process_count = config.process_count;
    let ring = spawn_ring(config).await?;

    if let (Some(base), Some(port)) = (cli.http_port, cli.admin_port()?) {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind admin port {port}"))?;
        let router = admin::router(ring.clone(), base, process_count);
        tokio::spawn(async move {
            if let Err(err) = admin::serve(listener, router).await {
                warn!(error = %err, "admin endpoint stopped");
            }
        });
    }

    if cli.console {
        println!("{} ready. Type HELP (or h) for commands.", ring.name());
        select! {
            result = console::run(&ring, BufReader::new(stdin()), stdout()) => result?,
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C"),
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("received Ctrl+C");
    }

    ring.shutdown().await?;
    Ok(())
}
