//! Haggle mock daemon binary
//!
//! Standalone stand-in daemon that can be spawned by supervisor tests.
//! Writes its PID file once the socket is accepting connections and removes
//! it again on exit.

use anyhow::Result;
use clap::Parser;
use haggle_mock_daemon::{MockDaemon, MockDaemonConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "haggle-mock-daemon", version, about = "Stand-in Haggle daemon")]
struct Args {
    /// Socket to listen on
    #[arg(long, default_value_os_t = haggle_protocol::default_socket_path())]
    socket: PathBuf,

    /// PID file to write once listening
    #[arg(long, default_value_os_t = haggle_protocol::default_pid_path())]
    pid_file: PathBuf,

    /// Wait this long before binding the socket
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,

    /// Write the PID file but never bind the socket
    #[arg(long)]
    hang: bool,

    /// Largest inline payload accepted on publish
    #[arg(long)]
    max_payload_bytes: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!(
        "Starting haggle mock daemon v{} (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    if args.hang {
        haggle_protocol::write_pid_file(&args.pid_file)?;
        warn!("Hanging without binding the socket");
        std::future::pending::<()>().await;
    }

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let mut config = MockDaemonConfig::default();
    if let Some(limit) = args.max_payload_bytes {
        config.max_payload_bytes = limit;
    }

    let daemon = MockDaemon::bind_with(&args.socket, config).await?;
    haggle_protocol::write_pid_file(&args.pid_file)?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if wait_for_signal().await.is_ok() {
            info!("Termination signal received");
            let _ = shutdown.send(());
        }
    });

    let result = daemon.run().await;
    haggle_protocol::remove_pid_file(&args.pid_file);
    info!("Mock daemon stopped");
    result
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => {}
        result = tokio::signal::ctrl_c() => result?,
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
