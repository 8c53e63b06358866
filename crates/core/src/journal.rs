//! Durable copy of the job tracker, backed by the storage crate.

use crate::models::{Failure, FailureKind, JobState, MediaItem};
use crate::tracker::JobSnapshot;
use anyhow::{anyhow, Context};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use storage::JobRow;

const TERMINAL_STATES: [&str; 2] = ["committed", "failed"];

#[derive(Clone)]
pub struct JobJournal {
    pool: SqlitePool,
}

impl JobJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connects to `database` and applies migrations.
    pub async fn open(database: &str) -> anyhow::Result<Self> {
        let pool = storage::connect(database).await.context("db connect")?;
        storage::migrate(&pool).await.context("db migrate")?;
        Ok(Self::new(pool))
    }

    pub async fn record(&self, snapshot: &JobSnapshot) -> anyhow::Result<()> {
        storage::upsert_job(&self.pool, &to_row(snapshot)).await
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<JobSnapshot>> {
        storage::fetch_job(&self.pool, id)
            .await?
            .map(from_row)
            .transpose()
    }

    pub async fn load(&self) -> anyhow::Result<Vec<JobSnapshot>> {
        storage::fetch_jobs(&self.pool)
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }

    /// Removes terminal jobs last updated before `cutoff`.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        storage::delete_jobs_before(&self.pool, cutoff.timestamp(), &TERMINAL_STATES).await
    }
}

fn to_row(snapshot: &JobSnapshot) -> JobRow {
    let (failure_kind, attempts, message) = match &snapshot.state {
        JobState::Failed(f) => (
            Some(f.kind.as_str().to_string()),
            i64::from(f.attempts),
            Some(f.message.clone()),
        ),
        _ => (None, 0, None),
    };
    JobRow {
        id: snapshot.item.id.clone(),
        source_path: snapshot.item.source_path.clone(),
        state: snapshot.state.name().to_string(),
        failure_kind,
        attempts,
        message,
        submitted_at: snapshot.item.submitted_at.timestamp(),
        updated_at: snapshot.updated_at.timestamp(),
        revision: snapshot.revision as i64,
    }
}

fn from_row(row: JobRow) -> anyhow::Result<JobSnapshot> {
    let state = match row.state.as_str() {
        "pending" => JobState::Pending,
        "annotating" => JobState::Annotating,
        "normalizing" => JobState::Normalizing,
        "indexing" => JobState::Indexing,
        "committed" => JobState::Committed,
        "failed" => {
            let kind = row
                .failure_kind
                .as_deref()
                .and_then(FailureKind::parse)
                .ok_or_else(|| anyhow!("job {} has unknown failure kind", row.id))?;
            JobState::Failed(Failure {
                kind,
                attempts: u32::try_from(row.attempts).unwrap_or_default(),
                message: row.message.unwrap_or_default(),
            })
        }
        other => return Err(anyhow!("job {} has unknown state {other}", row.id)),
    };
    Ok(JobSnapshot {
        item: MediaItem {
            id: row.id,
            source_path: row.source_path,
            submitted_at: timestamp(row.submitted_at),
        },
        state,
        updated_at: timestamp(row.updated_at),
        revision: u64::try_from(row.revision).unwrap_or_default(),
    })
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
