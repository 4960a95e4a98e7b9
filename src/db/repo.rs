use super::model::StagingSummary;
use crate::model::{PologContent, PologDraft, PublishedPolog, StagingEntry, UploadedRoute};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form; create the file on first open.
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn encode_content(content: &PologContent) -> Result<String> {
    serde_json::to_string(content).context("failed to encode polog payload")
}

// ---------------------------------------------------------------------------
// Drafts

#[instrument(skip_all)]
pub async fn save_draft(pool: &Pool, draft: &PologDraft) -> Result<()> {
    let payload = encode_content(&draft.content)?;
    sqlx::query(
        "INSERT INTO drafts (id, payload, created_at, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
    )
    .bind(draft.id())
    .bind(payload)
    .bind(draft.created_at)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to persist draft")?;
    Ok(())
}

fn draft_from_row(row: &SqliteRow) -> Result<PologDraft> {
    let payload: String = row.get("payload");
    let content: PologContent =
        serde_json::from_str(&payload).context("invalid draft payload")?;
    Ok(PologDraft {
        content,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[instrument(skip_all)]
pub async fn fetch_draft(pool: &Pool, id: &str) -> Result<Option<PologDraft>> {
    let row = sqlx::query("SELECT id, payload, created_at, updated_at FROM drafts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(draft_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_drafts(pool: &Pool) -> Result<Vec<PologDraft>> {
    let rows = sqlx::query(
        "SELECT id, payload, created_at, updated_at FROM drafts ORDER BY updated_at DESC, id",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(draft_from_row).collect()
}

#[instrument(skip_all)]
pub async fn delete_draft(pool: &Pool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM drafts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Promote a draft to a staging entry and delete the draft, atomically.
///
/// Re-committing an id that is still staged replaces its payload and clears
/// `finished_at`; uploads recorded for routes that still exist are kept.
#[instrument(skip_all)]
pub async fn commit_draft(pool: &Pool, id: &str) -> Result<StagingEntry> {
    let mut tx = pool.begin().await?;
    let payload: Option<String> = sqlx::query_scalar("SELECT payload FROM drafts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(payload) = payload else {
        return Err(anyhow!("draft {} not found", id));
    };
    let content: PologContent =
        serde_json::from_str(&payload).context("invalid draft payload")?;

    sqlx::query(
        "INSERT INTO staging (id, payload, total_upload_count, thumbnail_url, last_error, created_at, finished_at) \
         VALUES (?, ?, 0, NULL, NULL, ?, NULL) \
         ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, thumbnail_url = NULL, \
         last_error = NULL, finished_at = NULL, revision = staging.revision + 1",
    )
    .bind(id)
    .bind(&payload)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .context("failed to stage draft")?;

    let keep: HashSet<&str> = content.routes.iter().map(|r| r.id.as_str()).collect();
    let existing: Vec<String> =
        sqlx::query_scalar("SELECT route_id FROM staging_uploaded_routes WHERE staging_id = ?")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;
    for route_id in existing.iter().filter(|r| !keep.contains(r.as_str())) {
        sqlx::query("DELETE FROM staging_uploaded_routes WHERE staging_id = ? AND route_id = ?")
            .bind(id)
            .bind(route_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("DELETE FROM drafts WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let entry = fetch_staging_tx(&mut tx, id)
        .await?
        .ok_or_else(|| anyhow!("staging {} vanished during commit", id))?;
    tx.commit().await?;
    Ok(entry)
}

// ---------------------------------------------------------------------------
// Staging

const STAGING_COLUMNS: &str =
    "id, payload, total_upload_count, thumbnail_url, last_error, created_at, finished_at, revision";

fn staging_from_row(row: &SqliteRow, uploaded_routes: Vec<UploadedRoute>) -> StagingEntry {
    let id: String = row.get("id");
    let payload: Option<String> = row.get("payload");
    let polog = payload.and_then(|raw| match serde_json::from_str::<PologContent>(&raw) {
        Ok(content) => Some(content),
        Err(err) => {
            warn!(?err, staging_id = %id, "undecodable staging payload");
            None
        }
    });
    StagingEntry {
        id,
        polog,
        total_upload_count: row.get("total_upload_count"),
        uploaded_routes,
        thumbnail_url: row.get("thumbnail_url"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        finished_at: row.get("finished_at"),
        revision: row.get("revision"),
    }
}

async fn uploaded_routes_for<'e, E>(executor: E, staging_id: &str) -> Result<Vec<UploadedRoute>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT route_id, remote_asset_url FROM staging_uploaded_routes \
         WHERE staging_id = ? ORDER BY position",
    )
    .bind(staging_id)
    .fetch_all(executor)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| UploadedRoute {
            route_id: row.get("route_id"),
            remote_asset_url: row.get("remote_asset_url"),
        })
        .collect())
}

async fn fetch_staging_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
) -> Result<Option<StagingEntry>> {
    let row = sqlx::query(&format!("SELECT {} FROM staging WHERE id = ?", STAGING_COLUMNS))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let uploaded = uploaded_routes_for(&mut **tx, id).await?;
    Ok(Some(staging_from_row(&row, uploaded)))
}

/// All staging entries, oldest first.
#[instrument(skip_all)]
pub async fn fetch_all_staging(pool: &Pool) -> Result<Vec<StagingEntry>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM staging ORDER BY created_at ASC, id ASC",
        STAGING_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get("id");
        let uploaded = uploaded_routes_for(pool, &id).await?;
        entries.push(staging_from_row(&row, uploaded));
    }
    Ok(entries)
}

#[instrument(skip_all)]
pub async fn fetch_staging(pool: &Pool, id: &str) -> Result<Option<StagingEntry>> {
    let mut tx = pool.begin().await?;
    let entry = fetch_staging_tx(&mut tx, id).await?;
    tx.commit().await?;
    Ok(entry)
}

/// Upsert a staging entry (including its uploaded routes) by id.
///
/// Overwriting an existing row bumps its revision, so a registrar pass that
/// read the old row can no longer checkpoint over it.
#[instrument(skip_all)]
pub async fn save_staging(pool: &Pool, entry: &StagingEntry) -> Result<()> {
    let payload = entry.polog.as_ref().map(encode_content).transpose()?;
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO staging (id, payload, total_upload_count, thumbnail_url, last_error, created_at, finished_at, revision) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, \
         total_upload_count = excluded.total_upload_count, thumbnail_url = excluded.thumbnail_url, \
         last_error = excluded.last_error, finished_at = excluded.finished_at, \
         revision = staging.revision + 1",
    )
    .bind(&entry.id)
    .bind(payload)
    .bind(entry.total_upload_count)
    .bind(&entry.thumbnail_url)
    .bind(&entry.last_error)
    .bind(entry.created_at)
    .bind(entry.finished_at)
    .bind(entry.revision)
    .execute(&mut *tx)
    .await
    .context("failed to persist staging entry")?;

    replace_uploaded_routes(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(())
}

async fn replace_uploaded_routes(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &StagingEntry,
) -> Result<()> {
    sqlx::query("DELETE FROM staging_uploaded_routes WHERE staging_id = ?")
        .bind(&entry.id)
        .execute(&mut **tx)
        .await?;
    for (position, route) in entry.uploaded_routes.iter().enumerate() {
        sqlx::query(
            "INSERT INTO staging_uploaded_routes (staging_id, route_id, remote_asset_url, position) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&route.route_id)
        .bind(&route.remote_asset_url)
        .bind(position as i64)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Persist the registrar's bookkeeping for an entry: upload count, uploaded
/// routes, thumbnail url, `last_error` and `finished_at`. The payload is
/// never written.
///
/// Applies only while the row still has `entry.revision`. Returns `false`
/// (and writes nothing) once the entry was re-committed or removed.
#[instrument(skip_all, fields(staging_id = %entry.id))]
pub async fn checkpoint_staging(pool: &Pool, entry: &StagingEntry) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE staging SET total_upload_count = ?, thumbnail_url = ?, last_error = ?, finished_at = ? \
         WHERE id = ? AND revision = ?",
    )
    .bind(entry.total_upload_count)
    .bind(&entry.thumbnail_url)
    .bind(&entry.last_error)
    .bind(entry.finished_at)
    .bind(&entry.id)
    .bind(entry.revision)
    .execute(&mut *tx)
    .await
    .context("failed to checkpoint staging entry")?
    .rows_affected();
    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    replace_uploaded_routes(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(true)
}

/// Delete a finished entry, unless it was re-committed since it was read.
#[instrument(skip_all)]
pub async fn delete_finished_staging(pool: &Pool, id: &str, revision: i64) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let deleted = sqlx::query(
        "DELETE FROM staging WHERE id = ? AND revision = ? AND finished_at IS NOT NULL",
    )
    .bind(id)
    .bind(revision)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if deleted > 0 {
        sqlx::query("DELETE FROM staging_uploaded_routes WHERE staging_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(deleted > 0)
}

/// Note the most recent cycle-aborting error for an entry. Does not change
/// whether the entry is pending.
#[instrument(skip_all)]
pub async fn record_staging_error(pool: &Pool, id: &str, message: &str) -> Result<()> {
    sqlx::query("UPDATE staging SET last_error = ? WHERE id = ?")
        .bind(message)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_staging_summaries(pool: &Pool) -> Result<Vec<StagingSummary>> {
    let rows = sqlx::query(
        "SELECT s.id, s.payload, s.total_upload_count, s.last_error, s.created_at, s.finished_at, \
                (SELECT COUNT(*) FROM staging_uploaded_routes u WHERE u.staging_id = s.id) AS uploaded_count \
         FROM staging s ORDER BY s.created_at ASC, s.id ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let payload: Option<String> = row.get("payload");
            let content =
                payload.and_then(|raw| serde_json::from_str::<PologContent>(&raw).ok());
            StagingSummary {
                id: row.get("id"),
                title: content.as_ref().map(|c| c.title.clone()),
                route_count: content.as_ref().map(|c| c.routes.len() as i64).unwrap_or(0),
                uploaded_count: row.get("uploaded_count"),
                total_upload_count: row.get("total_upload_count"),
                last_error: row.get("last_error"),
                created_at: row.get("created_at"),
                finished_at: row.get("finished_at"),
            }
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn count_pending_staging(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staging WHERE finished_at IS NULL")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_staging(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staging")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Registrar lease

/// Try to take (or extend) the named lease for `holder` until `now + ttl`.
///
/// Succeeds when the lease is free, expired, or already held by `holder`.
#[instrument(skip_all, fields(lease = name))]
pub async fn try_acquire_lease(pool: &Pool, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
    let now = Utc::now().timestamp_millis();
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let acquired = sqlx::query(
        "INSERT INTO registrar_lease (name, holder, expires_at) VALUES (?, ?, ?) \
         ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at \
         WHERE registrar_lease.holder = excluded.holder OR registrar_lease.expires_at <= ?",
    )
    .bind(name)
    .bind(holder)
    .bind(now.saturating_add(ttl_ms))
    .bind(now)
    .execute(pool)
    .await
    .context("failed to acquire registrar lease")?
    .rows_affected();
    Ok(acquired > 0)
}

/// Drop the lease if `holder` still owns it.
#[instrument(skip_all, fields(lease = name))]
pub async fn release_lease(pool: &Pool, name: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM registrar_lease WHERE name = ? AND holder = ?")
        .bind(name)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Published

#[instrument(skip_all)]
pub async fn record_published(pool: &Pool, published: &PublishedPolog) -> Result<()> {
    let routes = serde_json::to_string(&published.routes).context("failed to encode routes")?;
    sqlx::query(
        "INSERT INTO published_pologs (id, thumbnail_url, routes, published_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET thumbnail_url = excluded.thumbnail_url, \
         routes = excluded.routes, published_at = excluded.published_at",
    )
    .bind(&published.id)
    .bind(&published.thumbnail_url)
    .bind(routes)
    .bind(published.published_at)
    .execute(pool)
    .await
    .context("failed to persist published polog")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_published(pool: &Pool, id: &str) -> Result<Option<PublishedPolog>> {
    let row = sqlx::query(
        "SELECT id, thumbnail_url, routes, published_at FROM published_pologs WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let routes: String = row.get("routes");
    let published_at: DateTime<Utc> = row.get("published_at");
    Ok(Some(PublishedPolog {
        id: row.get("id"),
        thumbnail_url: row.get("thumbnail_url"),
        routes: serde_json::from_str(&routes).context("invalid published routes")?,
        published_at,
    }))
}
