//! dagflow engine daemon.
//!
//! Binary name: `dagflowd`
//!
//! Loads configuration, initializes tracing, builds the engine over the
//! configured store, and runs consumers and sweepers until Ctrl+C or SIGTERM.

mod app;
mod sweeps;

use std::path::PathBuf;

use clap::Parser;
use dagflow_infra::config::{CONFIG_FILE, load_engine_config, resolve_data_dir};
use dagflow_observe::tracing_setup::{init_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "dagflowd", version, about = "Durable workflow orchestration engine")]
struct Cli {
    /// Path to the config file (default: {data_dir}/dagflow.toml).
    #[arg(long, env = "DAGFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long)]
    otel: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = resolve_data_dir();
    let config_path = cli.config.unwrap_or_else(|| data_dir.join(CONFIG_FILE));
    let mut config = load_engine_config(&config_path).await?;
    config.observe.otel |= cli.otel;
    config.observe.json |= cli.json;

    init_tracing(&config.observe).map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;
    tracing::info!(
        config = %config_path.display(),
        data_dir = %data_dir.display(),
        storage = ?config.storage,
        "dagflowd starting"
    );

    let result = app::run(config, data_dir, app::shutdown_signal()).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "dagflowd exited with error");
    }
    shutdown_tracing();
    result
}
