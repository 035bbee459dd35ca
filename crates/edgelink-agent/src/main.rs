//! Agent entry point.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edgelink_activity::SystemShell;
use edgelink_agent::startup::{Agent, AgentPaths};
use edgelink_core::AgentEnv;
use edgelink_mq::LocalBus;

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_logging(env: &AgentEnv) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&env.log_level));

    let log_file = (|| {
        if let Some(parent) = std::path::Path::new(&env.log_file).parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&env.log_file)
            .ok()
    })();

    match log_file {
        Some(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            tracing::warn!(path = %env.log_file, "log file unavailable, logging to stderr");
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = AgentEnv::from_env()?;
    init_logging(&env);

    tracing::info!(
        version = SERVICE_VERSION,
        role = ?env.role,
        log_file = %env.log_file,
        log_level = %env.log_level,
        "agent starting"
    );

    let agent = Agent::build(
        env,
        &AgentPaths::system(),
        LocalBus::new(),
        Arc::new(SystemShell::new()),
    )?;

    let cancel = CancellationToken::new();
    agent.start(cancel.clone()).await?;

    wait_for_signal().await;

    tracing::info!("stopping agent");
    cancel.cancel();
    agent.shutdown();

    Ok(())
}
