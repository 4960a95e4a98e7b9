use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use polog_sync::registrar::Registrar;
use polog_sync::{config, db, services_from_config};

#[derive(Debug, Parser)]
#[command(author, version, about = "Publish staged journal entries in the background")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let services = services_from_config(&cfg)?;
    let registrar = Registrar::new(pool, services, cfg.app.register_interval());
    registrar.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; waiting for in-flight cycle");
    registrar.shutdown().await;
    Ok(())
}
