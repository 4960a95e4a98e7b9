use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use polog_sync::model::{PologContent, PologDraft};
use polog_sync::{config, db};

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage journal drafts and the staging queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Save a draft from a JSON file (journal entry content)
    Import {
        #[arg(long)]
        draft: PathBuf,
        /// Commit the draft to the staging queue right away
        #[arg(long)]
        commit: bool,
    },
    /// Commit a saved draft to the staging queue
    Commit {
        #[arg(long)]
        id: String,
    },
    /// Discard a saved draft
    Discard {
        #[arg(long)]
        id: String,
    },
    /// Show drafts and staging progress
    List,
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

    match args.command {
        Command::Import { draft, commit } => {
            let raw = tokio::fs::read_to_string(&draft)
                .await
                .with_context(|| format!("failed to read draft: {}", draft.display()))?;
            let content: PologContent =
                serde_json::from_str(&raw).context("draft file is not valid journal content")?;
            let draft = match db::fetch_draft(&pool, &content.id).await? {
                Some(mut existing) => {
                    existing.content = content;
                    existing
                }
                None => PologDraft::new(content),
            };
            db::save_draft(&pool, &draft).await?;
            info!(id = %draft.id(), "draft saved");
            if commit {
                let staged = db::commit_draft(&pool, draft.id()).await?;
                info!(id = %staged.id, routes = staged.route_count(), "draft committed");
            }
        }
        Command::Commit { id } => {
            let staged = db::commit_draft(&pool, &id).await?;
            info!(id = %staged.id, routes = staged.route_count(), "draft committed");
        }
        Command::Discard { id } => {
            db::delete_draft(&pool, &id).await?;
            info!(%id, "draft discarded");
        }
        Command::List => {
            for draft in db::list_drafts(&pool).await? {
                println!(
                    "draft   {}  {:<32} routes={} updated={}",
                    draft.id(),
                    draft.content.title,
                    draft.content.routes.len(),
                    draft.updated_at.to_rfc3339()
                );
            }
            for s in db::list_staging_summaries(&pool).await? {
                let state = if s.is_pending() { "pending" } else { "finished" };
                println!(
                    "staged  {}  {:<32} {} uploaded={}/{} resolved={}{}",
                    s.id,
                    s.title.as_deref().unwrap_or("<no payload>"),
                    state,
                    s.uploaded_count,
                    s.route_count,
                    s.total_upload_count,
                    s.last_error
                        .as_deref()
                        .map(|e| format!(" last_error={}", e))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}
