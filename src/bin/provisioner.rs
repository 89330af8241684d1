//! # Provisioner
//!
//! Runs the provisioning workers and the admin API, applies database migrations,
//! or validates configuration.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use provisioner::config::{ConfigManager, StoreBackend};
use provisioner::database::{run_migrations, DatabaseConnection};
use provisioner::logging::init_structured_logging;
use provisioner::orchestration::ProvisionerCore;
use provisioner::web;

#[derive(Parser)]
#[command(name = "provisioner")]
#[command(about = "Hosting provisioning orchestrator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: config/provisioner or PROVISIONER_CONFIG_DIR)
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Environment name (default: PROVISIONER_ENV, APP_ENV, then development)
    #[arg(short, long, global = true)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool, stale-claim recovery and the admin API
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Load and validate configuration, then print it with secrets masked
    ValidateConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let environment = cli
        .environment
        .clone()
        .unwrap_or_else(ConfigManager::detect_environment);
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &environment)
        .context("failed to load configuration")?;
    init_structured_logging(&manager.config().logging, manager.environment());

    match cli.command {
        Commands::Serve => serve(manager).await,
        Commands::Migrate => migrate(&manager).await,
        Commands::ValidateConfig => {
            println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
            println!("✅ configuration for '{}' is valid", manager.environment());
            Ok(())
        }
    }
}

async fn serve(manager: Arc<ConfigManager>) -> anyhow::Result<()> {
    let web_config = manager.config().web.clone();
    let core = Arc::new(
        ProvisionerCore::from_config(manager)
            .await
            .context("failed to bootstrap provisioner")?,
    );

    let web_handle = if web_config.enabled {
        let mut stop = core.scheduler.shutdown_signal();
        let shutdown = async move {
            let _ = stop.wait_for(|stopping| *stopping).await;
        };
        let web_core = core.clone();
        Some(tokio::spawn(async move {
            web::serve(web_core, &web_config, shutdown).await
        }))
    } else {
        None
    };

    let signal_core = core.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Interrupt received, shutting down");
            signal_core.shutdown();
        }
    });

    let result = core.run().await;
    core.shutdown();

    if let Some(handle) = web_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Admin API stopped with error"),
            Err(join_error) => error!(%join_error, "Admin API task terminated abnormally"),
        }
    }

    result.context("provisioning workers halted")
}

async fn migrate(manager: &ConfigManager) -> anyhow::Result<()> {
    let config = manager.config();
    if config.store.backend != StoreBackend::Postgres {
        bail!("migrations apply to the postgres store; store.backend is {:?}", config.store.backend);
    }

    let connection = DatabaseConnection::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    run_migrations(connection.pool())
        .await
        .context("failed to apply migrations")?;
    connection.close().await;
    info!("✅ Migrations applied");
    Ok(())
}
