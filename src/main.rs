use dotenvy::dotenv;
use oxide_sandbox::config::SandboxSettings;
use oxide_sandbox::mcp;
use oxide_sandbox::sandbox::{DockerRuntime, Reaper, SandboxManager};
use oxide_sandbox::tools::{SandboxToolProvider, ToolProvider};
use oxide_sandbox::utils::cancel_on_signal;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenv().ok();

    // Stdout carries the MCP session, so logs go to stderr
    init_logging();

    info!("Starting oxide-sandbox...");

    let settings = init_settings();

    let runtime = DockerRuntime::connect(&settings).await?;
    info!("Container runtime connected.");

    let manager = Arc::new(SandboxManager::new(Arc::new(runtime), settings).await?);

    match manager.recover_orphans().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Removed containers left by a previous run"),
        Err(e) => warn!(error = %e, "Orphan recovery failed, the reaper will retry"),
    }

    let stop = CancellationToken::new();
    let reaper = Reaper::new(Arc::clone(&manager)).spawn(stop.clone());

    let provider: Arc<dyn ToolProvider> =
        Arc::new(SandboxToolProvider::new(Arc::clone(&manager)));

    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), stop.clone()));

    info!("Sandbox is ready, serving MCP on stdio");
    let served = mcp::serve_stdio(provider, stop.clone()).await;

    stop.cancel();
    if let Err(e) = reaper.await {
        warn!(error = %e, "Reaper task ended abnormally");
    }
    manager.shutdown().await;
    info!("All kernels destroyed.");

    served
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn init_settings() -> SandboxSettings {
    match SandboxSettings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}
