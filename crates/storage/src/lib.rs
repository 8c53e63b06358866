//! Storage layer: SQLite pool setup, migrations and the job journal.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub mod models;

pub use models::JobRow;

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let mut url = database_url.to_string();
    if !database_url.starts_with("sqlite:") {
        let path = std::path::PathBuf::from(database_url);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let norm = path.to_string_lossy().replace('\\', "/");
        if path.is_absolute() {
            url = format!("sqlite:///{}?mode=rwc", norm.trim_start_matches('/'));
        } else {
            url = format!("sqlite://{}?mode=rwc", norm);
        }
    }
    let mut opts = SqlitePoolOptions::new();
    if url.contains("memory") {
        opts = opts.max_connections(1);
    } else {
        opts = opts.max_connections(5);
    }
    let pool = opts.connect(&url).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    // Applies the migrations in crates/storage/migrations. Safe to rerun.
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert or replace the journal row for `row.id`. A write carrying an older
/// revision than the stored row is ignored.
pub async fn upsert_job(pool: &SqlitePool, row: &JobRow) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, source_path, state, failure_kind, attempts, message, submitted_at, updated_at, revision)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
            source_path=excluded.source_path,
            state=excluded.state,
            failure_kind=excluded.failure_kind,
            attempts=excluded.attempts,
            message=excluded.message,
            submitted_at=excluded.submitted_at,
            updated_at=excluded.updated_at,
            revision=excluded.revision
        WHERE excluded.revision >= jobs.revision
        "#,
    )
    .bind(&row.id)
    .bind(&row.source_path)
    .bind(&row.state)
    .bind(&row.failure_kind)
    .bind(row.attempts)
    .bind(&row.message)
    .bind(row.submitted_at)
    .bind(row.updated_at)
    .bind(row.revision)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_job(pool: &SqlitePool, id: &str) -> anyhow::Result<Option<JobRow>> {
    let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn fetch_jobs(pool: &SqlitePool) -> anyhow::Result<Vec<JobRow>> {
    let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs ORDER BY updated_at, id")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Deletes rows in one of `states` last updated before `cutoff` (unix seconds).
pub async fn delete_jobs_before(
    pool: &SqlitePool,
    cutoff: i64,
    states: &[&str],
) -> anyhow::Result<u64> {
    if states.is_empty() {
        return Ok(0);
    }
    let placeholders = std::iter::repeat("?")
        .take(states.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "DELETE FROM jobs WHERE updated_at < ? AND state IN ({})",
        placeholders
    );
    let mut q = sqlx::query(&sql).bind(cutoff);
    for state in states {
        q = q.bind(*state);
    }
    let res = q.execute(pool).await?;
    if res.rows_affected() > 0 {
        tracing::debug!(removed = res.rows_affected(), cutoff, "purged journal rows");
    }
    Ok(res.rows_affected())
}
