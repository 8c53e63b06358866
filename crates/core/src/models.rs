use chrono::{DateTime, Utc};
use providers::{AnnotatorError, IndexError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One submitted media item. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub source_path: String,
    pub submitted_at: DateTime<Utc>,
}

/// The external call a pipeline attempt is making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Annotate,
    Index,
}

impl Stage {
    /// Failure kind used when a call of this stage times out.
    pub fn unavailable_kind(self) -> FailureKind {
        match self {
            Stage::Annotate => FailureKind::AnnotatorUnavailable,
            Stage::Index => FailureKind::IndexUnavailable,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Annotate => write!(f, "annotate"),
            Stage::Index => write!(f, "upsert"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AnnotatorUnavailable,
    AnnotatorRejected,
    AnnotatorQuotaExceeded,
    IndexUnavailable,
    IndexRejected,
    Cancelled,
    /// The process stopped while the job was in flight.
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AnnotatorUnavailable => "annotator_unavailable",
            FailureKind::AnnotatorRejected => "annotator_rejected",
            FailureKind::AnnotatorQuotaExceeded => "annotator_quota_exceeded",
            FailureKind::IndexUnavailable => "index_unavailable",
            FailureKind::IndexRejected => "index_rejected",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "annotator_unavailable" => FailureKind::AnnotatorUnavailable,
            "annotator_rejected" => FailureKind::AnnotatorRejected,
            "annotator_quota_exceeded" => FailureKind::AnnotatorQuotaExceeded,
            "index_unavailable" => FailureKind::IndexUnavailable,
            "index_rejected" => FailureKind::IndexRejected,
            "cancelled" => FailureKind::Cancelled,
            "interrupted" => FailureKind::Interrupted,
            _ => return None,
        })
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::AnnotatorUnavailable
                | FailureKind::AnnotatorQuotaExceeded
                | FailureKind::IndexUnavailable
        )
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, FailureKind::AnnotatorQuotaExceeded)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in [`JobState::Failed`], and after how many attempts of
/// the stage that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub attempts: u32,
    pub message: String,
}

impl From<AnnotatorError> for Failure {
    fn from(err: AnnotatorError) -> Self {
        let kind = match &err {
            AnnotatorError::Unavailable(_) => FailureKind::AnnotatorUnavailable,
            AnnotatorError::Rejected(_) => FailureKind::AnnotatorRejected,
            AnnotatorError::QuotaExceeded(_) => FailureKind::AnnotatorQuotaExceeded,
        };
        Failure {
            kind,
            attempts: 0,
            message: err.to_string(),
        }
    }
}

impl From<IndexError> for Failure {
    fn from(err: IndexError) -> Self {
        let kind = match &err {
            IndexError::Unavailable(_) => FailureKind::IndexUnavailable,
            IndexError::Rejected(_) => FailureKind::IndexRejected,
        };
        Failure {
            kind,
            attempts: 0,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.kind, self.attempts, self.message
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Annotating,
    Normalizing,
    Indexing,
    Committed,
    Failed(Failure),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Committed | JobState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Annotating => "annotating",
            JobState::Normalizing => "normalizing",
            JobState::Indexing => "indexing",
            JobState::Committed => "committed",
            JobState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Failed(failure) => write!(f, "failed ({failure})"),
            other => f.write_str(other.name()),
        }
    }
}
