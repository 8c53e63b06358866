use futures::TryStreamExt;
use providers::memory::MemoryIndex;
use providers::{
    AnnotationResult, Annotator, AnnotatorError, IndexError, IndexRecord, IndexWriter, Label,
    RawColor, RecordStream,
};
use snapdex_core::journal::JobJournal;
use snapdex_core::retry::RetryPolicy;
use snapdex_core::tracker::JobSnapshot;
use snapdex_core::{
    FailureKind, IngestionPipeline, JobState, MediaItem, PipelineOptions, StatusError,
    SubmitError, SubmitRequest,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Annotator replaying a script of results; the last entry repeats forever.
struct ScriptedAnnotator {
    script: Mutex<VecDeque<Result<AnnotationResult, AnnotatorError>>>,
    calls: AtomicU32,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAnnotator {
    fn new(script: Vec<Result<AnnotationResult, AnnotatorError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            gate: None,
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn always(result: Result<AnnotationResult, AnnotatorError>) -> Self {
        Self::new(vec![result])
    }

    /// Each call blocks until the test adds a permit to the returned gate.
    fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_result(&self) -> Result<AnnotationResult, AnnotatorError> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

#[async_trait::async_trait]
impl Annotator for ScriptedAnnotator {
    async fn annotate(&self, _media_path: &str) -> Result<AnnotationResult, AnnotatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.next_result()
    }
}

/// Index failing with a script of errors before delegating to memory.
struct FlakyIndex {
    failures: Mutex<VecDeque<IndexError>>,
    calls: AtomicU32,
    inner: MemoryIndex,
}

impl FlakyIndex {
    fn new(failures: Vec<IndexError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            calls: AtomicU32::new(0),
            inner: MemoryIndex::new(),
        }
    }
}

#[async_trait::async_trait]
impl IndexWriter for FlakyIndex {
    async fn upsert(&self, record: &IndexRecord) -> Result<(), IndexError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(err) => Err(err),
            None => self.inner.upsert(record).await,
        }
    }

    fn search(&self, query: &str) -> RecordStream {
        self.inner.search(query)
    }
}

fn panda() -> AnnotationResult {
    AnnotationResult {
        labels: vec![Label::new("panda", 0.99)],
        dominant_colors: vec![RawColor::new((10.0, 10.0, 10.0), 1.0)],
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        quota_multiplier: 2,
        jitter_ratio: 0.2,
        timeout: Duration::from_secs(5),
    }
}

fn options(max_attempts: u32) -> PipelineOptions {
    PipelineOptions {
        annotate: fast_policy(max_attempts),
        index: fast_policy(max_attempts),
        max_concurrency: 4,
        job_ttl: Duration::from_secs(3_600),
    }
}

async fn wait(pipeline: &IngestionPipeline, id: &str) -> JobState {
    tokio::time::timeout(Duration::from_secs(10), pipeline.wait(id))
        .await
        .expect("job did not finish in time")
        .unwrap()
}

async fn wait_for_calls(annotator: &ScriptedAnnotator, calls: u32) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while annotator.calls() < calls {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("annotator was not called");
}

fn failure_of(state: JobState) -> (FailureKind, u32) {
    match state {
        JobState::Failed(f) => (f.kind, f.attempts),
        other => panic!("expected a failed job, got {other:?}"),
    }
}

#[tokio::test]
async fn end_to_end_commits_normalized_record() {
    let index = Arc::new(MemoryIndex::new());
    let pipeline = IngestionPipeline::new(
        Arc::new(ScriptedAnnotator::always(Ok(panda()))),
        index.clone(),
        options(3),
        None,
    );

    let id = pipeline
        .submit(SubmitRequest::new("/uploads/panda.jpg").with_id("m1"))
        .await
        .unwrap();
    assert_eq!(id, "m1");
    assert_eq!(wait(&pipeline, "m1").await, JobState::Committed);
    assert_eq!(pipeline.status("m1").await.unwrap(), JobState::Committed);

    let record = index.get("m1").unwrap();
    assert_eq!(record.id, "m1");
    assert_eq!(record.labels, vec![Label::new("panda", 0.99)]);
    assert_eq!(record.dominant_color.unwrap().rgb, (10, 10, 10));
    assert_eq!(record.source_path, "/uploads/panda.jpg");

    let hits: Vec<IndexRecord> = pipeline.query("panda").try_collect().await.unwrap();
    assert_eq!(hits, vec![record]);
}

#[tokio::test]
async fn retries_stop_after_exactly_max_attempts() {
    let annotator = Arc::new(ScriptedAnnotator::always(Err(AnnotatorError::Unavailable(
        "connection refused".into(),
    ))));
    let index = Arc::new(MemoryIndex::new());
    let pipeline = IngestionPipeline::new(annotator.clone(), index.clone(), options(4), None);

    pipeline
        .submit(SubmitRequest::new("/uploads/x.jpg").with_id("x"))
        .await
        .unwrap();
    let (kind, attempts) = failure_of(wait(&pipeline, "x").await);
    assert_eq!(kind, FailureKind::AnnotatorUnavailable);
    assert_eq!(attempts, 4);
    assert_eq!(annotator.calls(), 4);
    assert!(index.is_empty());
}

#[tokio::test]
async fn rejected_media_is_never_retried() {
    let annotator = Arc::new(ScriptedAnnotator::always(Err(AnnotatorError::Rejected(
        "not an image".into(),
    ))));
    let pipeline = IngestionPipeline::new(
        annotator.clone(),
        Arc::new(MemoryIndex::new()),
        options(5),
        None,
    );

    pipeline
        .submit(SubmitRequest::new("/uploads/doc.pdf").with_id("doc"))
        .await
        .unwrap();
    assert_eq!(
        failure_of(wait(&pipeline, "doc").await),
        (FailureKind::AnnotatorRejected, 1)
    );
    assert_eq!(annotator.calls(), 1);
}

#[tokio::test]
async fn transient_errors_recover() {
    let annotator = Arc::new(ScriptedAnnotator::new(vec![
        Err(AnnotatorError::Unavailable("reset".into())),
        Err(AnnotatorError::QuotaExceeded("429".into())),
        Ok(panda()),
    ]));
    let index = Arc::new(MemoryIndex::new());
    let pipeline = IngestionPipeline::new(annotator.clone(), index.clone(), options(3), None);

    pipeline
        .submit(SubmitRequest::new("/uploads/p.jpg").with_id("p"))
        .await
        .unwrap();
    assert_eq!(wait(&pipeline, "p").await, JobState::Committed);
    assert_eq!(annotator.calls(), 3);
    assert_eq!(index.len(), 1);
}

#[tokio::test]
async fn index_errors_follow_their_own_policy() {
    let index = Arc::new(FlakyIndex::new(vec![
        IndexError::Unavailable("503".into()),
        IndexError::Rejected("record too large".into()),
    ]));
    let pipeline = IngestionPipeline::new(
        Arc::new(ScriptedAnnotator::always(Ok(panda()))),
        index.clone(),
        options(5),
        None,
    );

    pipeline
        .submit(SubmitRequest::new("/uploads/big.jpg").with_id("big"))
        .await
        .unwrap();
    assert_eq!(
        failure_of(wait(&pipeline, "big").await),
        (FailureKind::IndexRejected, 2)
    );
    assert_eq!(index.calls.load(Ordering::SeqCst), 2);
    assert!(index.inner.is_empty());
}

#[tokio::test]
async fn index_exhaustion_fails_with_unavailable() {
    let index = Arc::new(FlakyIndex::new(vec![
        IndexError::Unavailable("503".into()),
        IndexError::Unavailable("503".into()),
    ]));
    let mut opts = options(5);
    opts.index = fast_policy(2);
    let pipeline = IngestionPipeline::new(
        Arc::new(ScriptedAnnotator::always(Ok(panda()))),
        index.clone(),
        opts,
        None,
    );

    pipeline
        .submit(SubmitRequest::new("/uploads/i.jpg").with_id("i"))
        .await
        .unwrap();
    assert_eq!(
        failure_of(wait(&pipeline, "i").await),
        (FailureKind::IndexUnavailable, 2)
    );
}

#[tokio::test]
async fn timeouts_count_as_unavailable() {
    let annotator =
        Arc::new(ScriptedAnnotator::always(Ok(panda())).slow(Duration::from_millis(500)));
    let mut opts = options(2);
    opts.annotate.timeout = Duration::from_millis(20);
    let pipeline =
        IngestionPipeline::new(annotator.clone(), Arc::new(MemoryIndex::new()), opts, None);

    pipeline
        .submit(SubmitRequest::new("/uploads/slow.jpg").with_id("slow"))
        .await
        .unwrap();
    assert_eq!(
        failure_of(wait(&pipeline, "slow").await),
        (FailureKind::AnnotatorUnavailable, 2)
    );
    assert_eq!(annotator.calls(), 2);
}

#[tokio::test]
async fn concurrent_duplicates_are_rejected() {
    let (annotator, gate) = ScriptedAnnotator::always(Ok(panda())).gated();
    let annotator = Arc::new(annotator);
    let pipeline = IngestionPipeline::new(
        annotator.clone(),
        Arc::new(MemoryIndex::new()),
        options(3),
        None,
    );

    let (a, b, c) = tokio::join!(
        pipeline.submit(SubmitRequest::new("/uploads/one.jpg").with_id("same")),
        pipeline.submit(SubmitRequest::new("/uploads/two.jpg").with_id("same")),
        pipeline.submit(SubmitRequest::new("/uploads/three.jpg").with_id("same")),
    );
    let results = [a, b, c];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, SubmitError::DuplicateInFlight(id) if id == "same")));

    wait_for_calls(&annotator, 1).await;
    gate.add_permits(1);
    assert_eq!(wait(&pipeline, "same").await, JobState::Committed);
    assert_eq!(annotator.calls(), 1);

    // A finished job may be submitted again as a new cycle.
    pipeline
        .submit(SubmitRequest::new("/uploads/one.jpg").with_id("same"))
        .await
        .unwrap();
    gate.add_permits(1);
    assert_eq!(wait(&pipeline, "same").await, JobState::Committed);
    assert_eq!(annotator.calls(), 2);
}

#[tokio::test]
async fn identical_bytes_share_an_id() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.png");
    let second = dir.path().join("copy-of-a.png");
    std::fs::write(&first, b"\x89PNG same bytes").unwrap();
    std::fs::write(&second, b"\x89PNG same bytes").unwrap();

    let (annotator, gate) = ScriptedAnnotator::always(Ok(panda())).gated();
    let pipeline = IngestionPipeline::new(
        Arc::new(annotator),
        Arc::new(MemoryIndex::new()),
        options(3),
        None,
    );

    let id = pipeline
        .submit(SubmitRequest::new(first.to_string_lossy()))
        .await
        .unwrap();
    assert_eq!(id, blake3::hash(b"\x89PNG same bytes").to_hex().to_string());
    let err = pipeline
        .submit(SubmitRequest::new(second.to_string_lossy()))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::DuplicateInFlight(dup) if dup == id));

    gate.add_permits(1);
    assert_eq!(wait(&pipeline, &id).await, JobState::Committed);

    let missing = pipeline
        .submit(SubmitRequest::new(dir.path().join("gone.png").to_string_lossy()))
        .await
        .unwrap_err();
    assert!(matches!(missing, SubmitError::Unreadable { .. }));
}

#[tokio::test]
async fn cancellation_applies_between_retries() {
    let annotator = Arc::new(ScriptedAnnotator::always(Err(AnnotatorError::Unavailable(
        "down".into(),
    ))));
    let mut opts = options(10);
    opts.annotate.base_backoff = Duration::from_secs(60);
    opts.annotate.max_backoff = Duration::from_secs(60);
    let pipeline =
        IngestionPipeline::new(annotator.clone(), Arc::new(MemoryIndex::new()), opts, None);

    pipeline
        .submit(SubmitRequest::new("/uploads/c.jpg").with_id("c"))
        .await
        .unwrap();
    wait_for_calls(&annotator, 1).await;
    assert!(pipeline.cancel("c"));

    assert_eq!(
        failure_of(wait(&pipeline, "c").await),
        (FailureKind::Cancelled, 1)
    );
    assert_eq!(annotator.calls(), 1);
    assert!(!pipeline.cancel("c"));
}

#[tokio::test]
async fn cancellation_waits_for_the_call_in_flight() {
    let (annotator, gate) = ScriptedAnnotator::always(Ok(panda())).gated();
    let annotator = Arc::new(annotator);
    let index = Arc::new(FlakyIndex::new(vec![]));
    let pipeline = IngestionPipeline::new(annotator.clone(), index.clone(), options(3), None);

    pipeline
        .submit(SubmitRequest::new("/uploads/f.jpg").with_id("f"))
        .await
        .unwrap();
    wait_for_calls(&annotator, 1).await;
    assert!(pipeline.cancel("f"));
    assert_eq!(pipeline.status("f").await.unwrap(), JobState::Annotating);

    gate.add_permits(1);
    let state = wait(&pipeline, "f").await;
    assert_eq!(failure_of(state), (FailureKind::Cancelled, 0));
    assert_eq!(index.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelling_a_pending_job_skips_the_annotator() {
    let (annotator, gate) = ScriptedAnnotator::always(Ok(panda())).gated();
    let annotator = Arc::new(annotator);
    let index = Arc::new(MemoryIndex::new());
    let mut opts = options(3);
    opts.max_concurrency = 1;
    let pipeline = IngestionPipeline::new(annotator.clone(), index.clone(), opts, None);

    pipeline
        .submit(SubmitRequest::new("/uploads/first.jpg").with_id("first"))
        .await
        .unwrap();
    wait_for_calls(&annotator, 1).await;
    pipeline
        .submit(SubmitRequest::new("/uploads/queued.jpg").with_id("queued"))
        .await
        .unwrap();
    assert_eq!(pipeline.status("queued").await.unwrap(), JobState::Pending);

    assert!(pipeline.cancel("queued"));
    assert_eq!(
        failure_of(wait(&pipeline, "queued").await),
        (FailureKind::Cancelled, 0)
    );

    gate.add_permits(1);
    assert_eq!(wait(&pipeline, "first").await, JobState::Committed);
    assert_eq!(annotator.calls(), 1);
    assert!(index.get("queued").is_none());
}

#[tokio::test]
async fn admission_is_bounded_by_max_concurrency() {
    let annotator =
        Arc::new(ScriptedAnnotator::always(Ok(panda())).slow(Duration::from_millis(30)));
    let index = Arc::new(MemoryIndex::new());
    let mut opts = options(3);
    opts.max_concurrency = 2;
    let pipeline = IngestionPipeline::new(annotator.clone(), index.clone(), opts, None);

    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(
            pipeline
                .submit(SubmitRequest::new(format!("/uploads/{n}.jpg")).with_id(format!("job-{n}")))
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        assert_eq!(wait(&pipeline, id).await, JobState::Committed);
    }
    assert!(annotator.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(index.len(), 6);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let pipeline = IngestionPipeline::new(
        Arc::new(ScriptedAnnotator::always(Ok(panda()))),
        Arc::new(MemoryIndex::new()),
        options(1),
        None,
    );
    assert!(matches!(
        pipeline.status("ghost").await,
        Err(StatusError::NotFound(id)) if id == "ghost"
    ));
    assert!(!pipeline.cancel("ghost"));
}

#[tokio::test]
async fn sweep_forgets_expired_jobs() {
    let mut opts = options(1);
    opts.job_ttl = Duration::ZERO;
    let pipeline = IngestionPipeline::new(
        Arc::new(ScriptedAnnotator::always(Ok(panda()))),
        Arc::new(MemoryIndex::new()),
        opts,
        None,
    );
    pipeline
        .submit(SubmitRequest::new("/uploads/s.jpg").with_id("s"))
        .await
        .unwrap();
    assert_eq!(wait(&pipeline, "s").await, JobState::Committed);
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(pipeline.sweep().await.unwrap(), 1);
    assert!(matches!(
        pipeline.status("s").await,
        Err(StatusError::NotFound(_))
    ));
}

#[tokio::test]
async fn journal_outlives_the_pipeline() {
    let db = "sqlite://file:core_pipeline_journal?mode=memory&cache=shared";
    let journal = JobJournal::open(db).await.unwrap();

    let first = IngestionPipeline::new(
        Arc::new(ScriptedAnnotator::always(Err(AnnotatorError::Rejected(
            "corrupt".into(),
        )))),
        Arc::new(MemoryIndex::new()),
        options(3),
        Some(journal.clone()),
    );
    first
        .submit(SubmitRequest::new("/uploads/bad.jpg").with_id("bad"))
        .await
        .unwrap();
    let state = wait(&first, "bad").await;
    journaled(&journal, "bad", |s| s.is_terminal()).await;
    drop(first);

    // A job that was mid-flight when its process stopped.
    let orphan = snapshot_in_flight("orphan");
    journal.record(&orphan).await.unwrap();

    let second = IngestionPipeline::new(
        Arc::new(ScriptedAnnotator::always(Ok(panda()))),
        Arc::new(MemoryIndex::new()),
        options(3),
        Some(journal.clone()),
    );
    assert_eq!(second.status("bad").await.unwrap(), state);

    assert_eq!(second.restore().await.unwrap(), 2);
    assert_eq!(
        failure_of(second.status("orphan").await.unwrap()),
        (FailureKind::Interrupted, 0)
    );
    let orphan_row = journal.get("orphan").await.unwrap().unwrap();
    assert!(matches!(orphan_row.state, JobState::Failed(_)));

    // The restored failure is terminal, so the id can be submitted again.
    second
        .submit(SubmitRequest::new("/uploads/orphan.jpg").with_id("orphan"))
        .await
        .unwrap();
    assert_eq!(wait(&second, "orphan").await, JobState::Committed);
    journaled(&journal, "orphan", |s| *s == JobState::Committed).await;
}

#[tokio::test]
async fn a_second_reader_sees_live_jobs_as_live() {
    let db = "sqlite://file:core_pipeline_shared_reader?mode=memory&cache=shared";
    let journal = JobJournal::open(db).await.unwrap();

    let (annotator, gate) = ScriptedAnnotator::always(Ok(panda())).gated();
    let annotator = Arc::new(annotator);
    let owner = IngestionPipeline::new(
        annotator.clone(),
        Arc::new(MemoryIndex::new()),
        options(3),
        Some(journal.clone()),
    );
    owner
        .submit(SubmitRequest::new("/uploads/live.jpg").with_id("live"))
        .await
        .unwrap();
    wait_for_calls(&annotator, 1).await;
    journaled(&journal, "live", |s| *s == JobState::Annotating).await;

    let reader = IngestionPipeline::new(
        Arc::new(ScriptedAnnotator::always(Ok(panda()))),
        Arc::new(MemoryIndex::new()),
        options(3),
        Some(journal.clone()),
    );
    assert_eq!(reader.status("live").await.unwrap(), JobState::Annotating);
    assert_eq!(
        journal.get("live").await.unwrap().unwrap().state,
        JobState::Annotating
    );

    gate.add_permits(1);
    assert_eq!(wait(&owner, "live").await, JobState::Committed);
    journaled(&journal, "live", |s| *s == JobState::Committed).await;
    assert_eq!(reader.status("live").await.unwrap(), JobState::Committed);
}

/// Polls until the journal row for `id` satisfies `done`.
async fn journaled(journal: &JobJournal, id: &str, done: impl Fn(&JobState) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = journal.get(id).await.unwrap() {
                if done(&snapshot.state) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("journal never caught up");
}

fn snapshot_in_flight(id: &str) -> JobSnapshot {
    JobSnapshot {
        item: MediaItem {
            id: id.to_string(),
            source_path: format!("/uploads/{id}.jpg"),
            submitted_at: chrono::Utc::now(),
        },
        state: JobState::Indexing,
        updated_at: chrono::Utc::now(),
        revision: 1,
    }
}
