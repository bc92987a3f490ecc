use std::sync::Arc;

use clap::Parser;
use tracing::info;

use mpgate::cli::{Cli, Command};
use mpgate::config::Config;
use mpgate::dispatch::Dispatcher;
use mpgate::logging::{init_logging, LogConfig};
use mpgate::tenant::manager::SessionManager;
use mpgate::tenant::registry::TenantRegistry;
use mpgate::tenant::{MemoryCatalog, MemoryHistory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both run the gateway.
        None | Some(Command::Start) => run_gateway().await,

        Some(Command::Version) => {
            mpgate::cli::handle_version();
            Ok(())
        }
    }
}

async fn run_gateway() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    init_logging(LogConfig::with_format(config.log_format))?;

    info!(endpoint = %config.endpoint, "starting mpgate");

    // Deployments plug a persistent catalog/history behind these traits;
    // the in-memory stores keep a fresh instance self-contained.
    let catalog = Arc::new(MemoryCatalog::new());
    let registry = Arc::new(TenantRegistry::new());
    let history = Arc::new(MemoryHistory::new());

    let dispatcher = Arc::new(
        Dispatcher::new(catalog.clone(), registry.clone(), history)
            .with_global_webhook(config.global_webhook.clone())
            .with_skip_media(config.skip_media),
    );

    let manager = Arc::new(SessionManager::new(
        config.session_config(),
        catalog,
        registry,
        dispatcher,
    ));

    manager.bootstrap().await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.shutdown();

    Ok(())
}
