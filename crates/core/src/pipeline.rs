//! Ingestion pipeline: annotate, normalize and upsert each submitted item.
//!
//! Each item runs as its own task through Pending → Annotating → Normalizing
//! → Indexing → Committed, or ends in Failed. Admission is bounded by a
//! semaphore sized from `pipeline.max_concurrency`; retries of transient
//! provider errors back off per [`RetryPolicy`].

use crate::config::{AppConfig, ProviderConfig};
use crate::error::{StatusError, SubmitError};
use crate::journal::JobJournal;
use crate::models::{Failure, FailureKind, JobState, MediaItem, Stage};
use crate::normalizer;
use crate::retry::RetryPolicy;
use crate::tracker::{JobSnapshot, JobTracker};
use anyhow::Context;
use chrono::Utc;
use providers::http_annotator::{HttpAnnotator, HttpAnnotatorConfig};
use providers::http_index::{HttpIndex, HttpIndexConfig};
use providers::memory::MemoryIndex;
use providers::noop::NoopAnnotator;
use providers::{Annotator, IndexWriter, ProviderRegistry, RecordStream};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub annotate: RetryPolicy,
    pub index: RetryPolicy,
    pub max_concurrency: usize,
    pub job_ttl: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            annotate: RetryPolicy::default(),
            index: RetryPolicy::default(),
            max_concurrency: 4,
            job_ttl: Duration::from_secs(3_600),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            annotate: config.annotator.retry_policy(),
            index: config.index.retry_policy(),
            max_concurrency: config.pipeline.max_concurrency.max(1),
            job_ttl: config.pipeline.job_ttl(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub media_path: String,
    /// Caller-chosen id. Defaults to the content hash of the media.
    pub id: Option<String>,
}

impl SubmitRequest {
    pub fn new(media_path: impl Into<String>) -> Self {
        Self {
            media_path: media_path.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Clone)]
pub struct IngestionPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    annotator: Arc<dyn Annotator>,
    index: Arc<dyn IndexWriter>,
    tracker: JobTracker,
    limiter: Semaphore,
    options: PipelineOptions,
    journal: Option<JobJournal>,
}

impl IngestionPipeline {
    pub fn new(
        annotator: Arc<dyn Annotator>,
        index: Arc<dyn IndexWriter>,
        options: PipelineOptions,
        journal: Option<JobJournal>,
    ) -> Self {
        let permits = options.max_concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                annotator,
                index,
                tracker: JobTracker::new(),
                limiter: Semaphore::new(permits),
                options,
                journal,
            }),
        }
    }

    /// Accepts a media item and starts processing it in the background.
    /// Returns the item id without waiting for the outcome.
    pub async fn submit(&self, request: SubmitRequest) -> Result<String, SubmitError> {
        let id = match request.id {
            Some(id) if id.trim().is_empty() => return Err(SubmitError::InvalidId),
            Some(id) => id,
            None => content_id(&request.media_path).await?,
        };
        let item = MediaItem {
            id: id.clone(),
            source_path: request.media_path,
            submitted_at: Utc::now(),
        };

        let (snapshot, cancel) = self.inner.tracker.begin(item.clone())?;
        debug!(id = %id, path = %item.source_path, "accepted");
        self.inner.record(&snapshot).await;

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(item, cancel).await });
        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Result<JobState, StatusError> {
        if let Some(snapshot) = self.inner.tracker.get(id) {
            return Ok(snapshot.state);
        }
        if let Some(journal) = &self.inner.journal {
            if let Some(snapshot) = journal.get(id).await.map_err(StatusError::Journal)? {
                return Ok(snapshot.state);
            }
        }
        Err(StatusError::NotFound(id.to_string()))
    }

    /// Resolves once the job for `id` is terminal.
    pub async fn wait(&self, id: &str) -> Result<JobState, StatusError> {
        let Some(mut rx) = self.inner.tracker.subscribe(id) else {
            return self.status(id).await;
        };
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_terminal() {
                return Ok(current);
            }
            if rx.changed().await.is_err() {
                return Ok(rx.borrow().clone());
            }
        }
    }

    /// Requests cancellation. Takes effect before the job's next provider
    /// call; a call already in flight is allowed to finish.
    pub fn cancel(&self, id: &str) -> bool {
        let requested = self.inner.tracker.cancel(id);
        if requested {
            info!(id, "cancellation requested");
        }
        requested
    }

    pub fn query(&self, text: &str) -> RecordStream {
        self.inner.index.search(text)
    }

    /// Loads journaled jobs into the tracker. Jobs the journal shows as still
    /// in flight belonged to a stopped process and are marked interrupted.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let Some(journal) = &self.inner.journal else {
            return Ok(0);
        };
        let mut restored = 0;
        for snapshot in journal.load().await.context("load job journal")? {
            let id = snapshot.item.id.clone();
            let interrupted = !snapshot.state.is_terminal();
            if !self.inner.tracker.restore(snapshot) {
                continue;
            }
            restored += 1;
            if interrupted {
                warn!(id = %id, "job was in flight when the previous process stopped");
                let failed = JobState::Failed(Failure {
                    kind: FailureKind::Interrupted,
                    attempts: 0,
                    message: "process stopped before the job finished".into(),
                });
                if let Some(snapshot) = self.inner.tracker.transition(&id, failed) {
                    self.inner.record(&snapshot).await;
                }
            }
        }
        Ok(restored)
    }

    /// Forgets terminal jobs older than the configured TTL.
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let ttl = chrono::Duration::from_std(self.inner.options.job_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - ttl;
        let purged = self.inner.tracker.purge_before(cutoff).len();
        if let Some(journal) = &self.inner.journal {
            journal.purge_before(cutoff).await.context("purge job journal")?;
        }
        if purged > 0 {
            debug!(purged, "swept expired jobs");
        }
        Ok(purged)
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.inner.tracker.get(id)
    }
}

impl Inner {
    async fn run(self: Arc<Self>, item: MediaItem, cancel: CancellationToken) {
        let outcome = self.process(&item, &cancel).await;
        let state = match outcome {
            Ok(()) => {
                info!(id = %item.id, "committed");
                JobState::Committed
            }
            Err(failure) => {
                if failure.kind.is_transient() {
                    warn!(id = %item.id, kind = %failure.kind, attempts = failure.attempts, "giving up: {}", failure.message);
                } else {
                    error!(id = %item.id, kind = %failure.kind, attempts = failure.attempts, "failed: {}", failure.message);
                }
                JobState::Failed(failure)
            }
        };
        self.set_state(&item.id, state).await;
    }

    async fn process(&self, item: &MediaItem, cancel: &CancellationToken) -> Result<(), Failure> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(Stage::Annotate, 0)),
            permit = self.limiter.acquire() => permit.map_err(|_| Failure {
                kind: FailureKind::Interrupted,
                attempts: 0,
                message: "pipeline is shutting down".into(),
            })?,
        };

        self.set_state(&item.id, JobState::Annotating).await;
        let annotation = self
            .with_retries(Stage::Annotate, item, cancel, &self.options.annotate, || {
                self.annotator.annotate(&item.source_path)
            })
            .await?;

        self.set_state(&item.id, JobState::Normalizing).await;
        let record = normalizer::normalize(item, &annotation);
        debug!(id = %item.id, labels = record.labels.len(), "normalized");

        self.set_state(&item.id, JobState::Indexing).await;
        self.with_retries(Stage::Index, item, cancel, &self.options.index, || {
            self.index.upsert(&record)
        })
        .await
    }

    /// Runs `call` up to `policy.max_attempts` times. Cancellation is checked
    /// before every attempt and during backoff, never during a call.
    async fn with_retries<T, E, F, Fut>(
        &self,
        stage: Stage,
        item: &MediaItem,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
        mut call: F,
    ) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Failure: From<E>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(stage, attempt));
            }
            attempt += 1;

            let mut failure = match tokio::time::timeout(policy.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => Failure::from(err),
                Err(_) => Failure {
                    kind: stage.unavailable_kind(),
                    attempts: 0,
                    message: format!("{stage} timed out after {:?}", policy.timeout),
                },
            };
            failure.attempts = attempt;

            if !failure.kind.is_transient() || attempt >= policy.max_attempts {
                return Err(failure);
            }

            let delay = policy.delay(&item.id, attempt, failure.kind.is_quota());
            warn!(
                id = %item.id,
                %stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying: {}",
                failure.message
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(stage, attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn set_state(&self, id: &str, state: JobState) {
        if let Some(snapshot) = self.tracker.transition(id, state) {
            self.record(&snapshot).await;
        }
    }

    async fn record(&self, snapshot: &JobSnapshot) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(snapshot).await {
                warn!(id = %snapshot.item.id, state = snapshot.state.name(), "journal write failed: {e:#}");
            }
        }
    }
}

fn cancelled(stage: Stage, attempts: u32) -> Failure {
    Failure {
        kind: FailureKind::Cancelled,
        attempts,
        message: format!("cancelled before {stage} attempt {}", attempts + 1),
    }
}

/// Hex blake3 digest of the file contents.
pub async fn content_id(path: &str) -> Result<String, SubmitError> {
    let owned = path.to_string();
    tokio::task::spawn_blocking(move || full_hash(Path::new(&owned)))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        .and_then(|r| r)
        .map_err(|source| SubmitError::Unreadable {
            path: path.to_string(),
            source,
        })
}

fn full_hash(path: &Path) -> std::io::Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn build_registry(config: &AppConfig) -> anyhow::Result<ProviderRegistry> {
    let mut reg = ProviderRegistry::new()
        .with_annotator("noop", Arc::new(NoopAnnotator))
        .with_index("memory", Arc::new(MemoryIndex::new()));

    if let Some(endpoint) = &config.annotator.endpoint {
        let annotator = HttpAnnotator::new(HttpAnnotatorConfig {
            endpoint: endpoint.clone(),
            credentials: config.annotator.resolve_credentials(),
        })?;
        reg = reg.with_annotator("http", Arc::new(annotator));
    }

    if let Some(endpoint) = &config.index.endpoint {
        let index = HttpIndex::new(HttpIndexConfig {
            endpoint: endpoint.clone(),
            credentials: config.index.resolve_credentials(),
        })?;
        reg = reg.with_index("http", Arc::new(index));
    }

    Ok(reg
        .set_preferred_annotator(&config.annotator.provider)
        .set_preferred_index(&config.index.provider))
}

/// Builds the pipeline described by `config` and replays the job journal.
/// Only the process that will run jobs should call this: replay marks every
/// in-flight journal row as interrupted.
pub async fn build_pipeline(config: &AppConfig) -> anyhow::Result<IngestionPipeline> {
    let pipeline = open_pipeline(config).await?;
    let restored = pipeline.restore().await?;
    if restored > 0 {
        info!(restored, "restored jobs from journal");
    }
    Ok(pipeline)
}

/// Builds the pipeline described by `config` without touching journaled
/// jobs. `status` reads through to the journal, so jobs owned by another
/// process are reported as that process last wrote them.
pub async fn open_pipeline(config: &AppConfig) -> anyhow::Result<IngestionPipeline> {
    config.validate()?;
    let registry = build_registry(config)?;
    let annotator = registry
        .annotator(None)
        .with_context(|| provider_context("annotator", &config.annotator))?;
    let index = registry
        .index(None)
        .with_context(|| provider_context("index", &config.index))?;

    let journal = match &config.database.path {
        Some(path) => Some(JobJournal::open(path).await?),
        None => None,
    };

    Ok(IngestionPipeline::new(
        annotator,
        index,
        PipelineOptions::from_config(config),
        journal,
    ))
}

fn provider_context(section: &str, cfg: &ProviderConfig) -> String {
    format!("{section} provider {:?}", cfg.provider)
}
