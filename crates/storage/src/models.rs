use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One journaled job. Timestamps are unix seconds; `revision` orders writes
/// for the same id.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub source_path: String,
    pub state: String,
    pub failure_kind: Option<String>,
    pub attempts: i64,
    pub message: Option<String>,
    pub submitted_at: i64,
    pub updated_at: i64,
    pub revision: i64,
}
