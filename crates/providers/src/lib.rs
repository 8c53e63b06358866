//! Provider abstractions for annotators and search indexes.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod http_annotator;
pub mod http_index;
pub mod memory;
pub mod noop;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider misconfigured: {0}")]
    Misconfigured(String),
}

/// Failures reported by an [`Annotator`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnnotatorError {
    /// Network or provider outage. Retryable.
    #[error("annotator unavailable: {0}")]
    Unavailable(String),
    /// Malformed or unsupported media. Never retried.
    #[error("annotator rejected media: {0}")]
    Rejected(String),
    /// Provider-side rate limit. Retryable with a longer backoff.
    #[error("annotator quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// Failures reported by an [`IndexWriter`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),
    #[error("index rejected record: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub text: String,
    pub score: f32,
}

impl Label {
    pub fn new(text: impl Into<String>, score: f32) -> Self {
        Self {
            text: text.into(),
            score,
        }
    }
}

/// A color fact exactly as the provider reported it. Channels are floats
/// because providers are free to report fractional or out-of-range values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawColor {
    pub rgb: (f32, f32, f32),
    pub weight: f32,
}

impl RawColor {
    pub fn new(rgb: (f32, f32, f32), weight: f32) -> Self {
        Self { rgb, weight }
    }
}

/// Raw annotator output for one media item. May contain duplicate labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationResult {
    pub labels: Vec<Label>,
    pub dominant_colors: Vec<RawColor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorFact {
    pub rgb: (u8, u8, u8),
    pub weight: f32,
}

/// The normalized document written to the index, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    pub labels: Vec<Label>,
    pub dominant_color: Option<ColorFact>,
    pub source_path: String,
    pub submitted_at: DateTime<Utc>,
}

/// Lazily produced search hits.
pub type RecordStream = BoxStream<'static, Result<IndexRecord, IndexError>>;

#[async_trait::async_trait]
pub trait Annotator: Send + Sync {
    /// Returns label and color facts for the media at `media_path`. Labels and
    /// colors succeed or fail together.
    async fn annotate(&self, media_path: &str) -> Result<AnnotationResult, AnnotatorError>;
}

#[async_trait::async_trait]
pub trait IndexWriter: Send + Sync {
    /// Insert-or-replace keyed by `record.id`. Replacement is whole-record.
    async fn upsert(&self, record: &IndexRecord) -> Result<(), IndexError>;

    fn search(&self, query: &str) -> RecordStream;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    annotators: HashMap<String, Arc<dyn Annotator>>,
    indexes: HashMap<String, Arc<dyn IndexWriter>>,
    pub preferred_annotator: Option<String>,
    pub preferred_index: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_annotator(mut self, name: &str, provider: Arc<dyn Annotator>) -> Self {
        self.annotators.insert(name.to_string(), provider);
        self
    }

    pub fn with_index(mut self, name: &str, provider: Arc<dyn IndexWriter>) -> Self {
        self.indexes.insert(name.to_string(), provider);
        self
    }

    pub fn set_preferred_annotator(mut self, name: &str) -> Self {
        self.preferred_annotator = Some(name.to_string());
        self
    }

    pub fn set_preferred_index(mut self, name: &str) -> Self {
        self.preferred_index = Some(name.to_string());
        self
    }

    pub fn annotator(&self, name: Option<&str>) -> Result<Arc<dyn Annotator>, ProviderError> {
        let key = name
            .map(str::to_string)
            .or_else(|| self.preferred_annotator.clone())
            .ok_or_else(|| ProviderError::UnknownProvider("no annotator configured".into()))?;
        self.annotators
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(key))
    }

    pub fn index(&self, name: Option<&str>) -> Result<Arc<dyn IndexWriter>, ProviderError> {
        let key = name
            .map(str::to_string)
            .or_else(|| self.preferred_index.clone())
            .ok_or_else(|| ProviderError::UnknownProvider("no index configured".into()))?;
        self.indexes
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(key))
    }
}
