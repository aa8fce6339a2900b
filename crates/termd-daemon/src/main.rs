//! termd - terminal/process core daemon
//!
//! Starts the control channel server, the PTY gateway client and the stale
//! process reaper, then runs until interrupted.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use termd_core::{
    ControlServer, ControlServerOptions, CoreConfig, StaleProcessReaper, TerminalCore,
};

fn log_filter() -> EnvFilter {
    // RUST_LOG wins; TERMD_LOG_LEVEL sets just our own crates.
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var("TERMD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    EnvFilter::new(format!("termd={level},termd_core={level}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("TERMD_LOG_DIR").unwrap_or_else(|_| "/tmp/termd".to_string());
    let file_appender = tracing_appender::rolling::daily(&log_dir, "termd.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        error!(panic = %info, "Daemon panicked");
    }));

    let config = CoreConfig::from_env();
    info!(
        control_port = config.control_port,
        gateway_url = %config.gateway_url,
        "termd starting"
    );

    let core = TerminalCore::new(config.clone());
    core.start();

    let mut server = ControlServer::new(
        ControlServerOptions {
            port: config.control_port,
        },
        core.registry(),
        core.gateway(),
        core.exec_socket(),
    );
    server.start().await?;

    let mut reaper = StaleProcessReaper::new(
        core.exec_stream(),
        core.exec_socket(),
        config.idle_threshold,
        config.reaper_interval,
    );
    reaper.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    reaper.stop();
    server.stop();
    core.shutdown();
    info!("termd stopped");
    Ok(())
}
