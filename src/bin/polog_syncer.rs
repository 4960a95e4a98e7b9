use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use polog_sync::registrar::{self, RegisterReport};
use polog_sync::{config, db, services_from_config};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Publish all staged journal entries and exit when the queue is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Consecutive failing passes before giving up (defaults to app.max_failed_passes)
    #[arg(long)]
    max_failed_passes: Option<u32>,
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
    let max_failed = args.max_failed_passes.unwrap_or(cfg.app.max_failed_passes);
    let pause = cfg.app.register_interval();

    let remaining = db::count_staging(&pool).await?;
    info!(remaining, "starting drain");
    if remaining == 0 {
        info!("No staged entries, exiting");
        return Ok(());
    }

    let mut totals = RegisterReport::default();
    let mut failed_passes = 0u32;

    loop {
        match registrar::register(&pool, &services).await {
            Ok(report) if report.contended => {
                info!("another pass holds the store; waiting");
                tokio::time::sleep(pause.max(Duration::from_secs(1))).await;
                continue;
            }
            Ok(report) => {
                failed_passes = 0;
                totals.deleted += report.deleted;
                totals.skipped += report.skipped;
                totals.published += report.published;
                totals.uploaded += report.uploaded;
                totals.superseded += report.superseded;
                info!(?report, "pass finished");
            }
            Err(err) => {
                failed_passes += 1;
                error!(?err, failed_passes, "pass aborted");
                if failed_passes >= max_failed {
                    error!(
                        threshold = max_failed,
                        "Giving up after {} consecutive failing passes", failed_passes
                    );
                    break;
                }
            }
        }

        let remaining = db::count_staging(&pool).await?;
        let pending = db::count_pending_staging(&pool).await?;
        if remaining == 0 {
            info!(?totals, "All staged entries published");
            return Ok(());
        }
        if pending == 0 {
            // Finished rows are removed at the start of the next pass.
            continue;
        }
        if failed_passes > 0 {
            warn!(pending, "retrying after pause");
            tokio::time::sleep(pause.max(Duration::from_secs(1))).await;
        } else {
            // Entries without payload never drain; don't spin on them.
            let skippable = db::fetch_all_staging(&pool)
                .await?
                .iter()
                .all(|e| e.polog.is_none() || e.is_finished());
            if skippable {
                warn!(pending, "only entries without payload remain, exiting");
                break;
            }
        }
    }

    let summaries = db::list_staging_summaries(&pool).await?;
    for s in summaries.iter().filter(|s| s.is_pending()) {
        warn!(
            id = %s.id,
            uploaded = s.uploaded_count,
            routes = s.route_count,
            last_error = s.last_error.as_deref().unwrap_or(""),
            "entry left pending"
        );
    }
    Ok(())
}
