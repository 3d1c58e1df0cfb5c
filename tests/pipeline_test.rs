//! End-to-end worker engine tests over in-memory fakes for the object
//! store, inference backend, and result store. The queue is the real
//! in-process backend; time is paused for deterministic retries.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use uuid::Uuid;

use pod_ocr_pipeline::db::results::{ResultStore, StoreError};
use pod_ocr_pipeline::models::job::{FailureReason, FailureRecord, Job, Priority};
use pod_ocr_pipeline::models::result::JobResult;
use pod_ocr_pipeline::services::encryption::EncryptionService;
use pod_ocr_pipeline::services::inference::{
    InferenceBackend, InferenceOutcome, OutcomeFailure, TextLine,
};
use pod_ocr_pipeline::services::queue::{JobQueue, MemoryQueue};
use pod_ocr_pipeline::services::storage::{ObjectStore, StorageError};
use pod_ocr_pipeline::worker::{Worker, WorkerConfig, WorkerContext};

// ── Fakes ────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Returns one pre-scripted outcome batch per infer() call and records the
/// batch sizes it was handed.
#[derive(Default)]
struct ScriptedBackend {
    responses: Mutex<Vec<Vec<InferenceOutcome>>>,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedBackend {
    fn push_batch(&self, outcomes: Vec<InferenceOutcome>) {
        self.responses.lock().unwrap().push(outcomes);
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn infer(&self, images: &[Vec<u8>]) -> Vec<InferenceOutcome> {
        self.calls.lock().unwrap().push(images.len());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            panic!("infer() called with no scripted response");
        }
        let batch = responses.remove(0);
        assert_eq!(batch.len(), images.len(), "scripted batch size mismatch");
        batch
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Default)]
struct MemoryResults {
    results: Mutex<HashMap<Uuid, JobResult>>,
    statuses: Mutex<HashMap<Uuid, String>>,
    failures: Mutex<Vec<FailureRecord>>,
    fail_persist: AtomicBool,
}

#[async_trait]
impl ResultStore for MemoryResults {
    async fn mark_processing(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.statuses.lock().unwrap().insert(job_id, "processing".into());
        Ok(())
    }

    async fn persist_result(&self, result: &JobResult) -> Result<(), StoreError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("result store down".into()));
        }
        self.results.lock().unwrap().insert(result.job_id, result.clone());
        self.statuses.lock().unwrap().insert(result.job_id, "completed".into());
        Ok(())
    }

    async fn mark_requeued(&self, job_id: Uuid, _retry_count: u32) -> Result<(), StoreError> {
        self.statuses.lock().unwrap().insert(job_id, "queued".into());
        Ok(())
    }

    async fn mark_dead_lettered(
        &self,
        job_id: Uuid,
        _reason: FailureReason,
    ) -> Result<(), StoreError> {
        self.statuses.lock().unwrap().insert(job_id, "dead_lettered".into());
        Ok(())
    }

    async fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError> {
        self.failures.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

const VISIBILITY: Duration = Duration::from_secs(30);

struct Harness {
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryStore>,
    backend: Arc<ScriptedBackend>,
    results: Arc<MemoryResults>,
    crypto: Arc<EncryptionService>,
    worker: Worker,
}

fn harness_with_retries(max_retries: u32) -> Harness {
    let queue = Arc::new(
        MemoryQueue::new(1_000, max_retries).with_poll_timeout(Duration::from_millis(50)),
    );
    let store = Arc::new(MemoryStore::default());
    let backend = Arc::new(ScriptedBackend::default());
    let results = Arc::new(MemoryResults::default());
    let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
    let crypto = Arc::new(EncryptionService::new(&key).unwrap());

    let ctx = WorkerContext {
        queue: queue.clone(),
        store: store.clone(),
        backend: backend.clone(),
        results: results.clone(),
        crypto: crypto.clone(),
        config: WorkerConfig {
            batch_size: 16,
            visibility_timeout: VISIBILITY,
            confidence_threshold: 0.95,
            retry_base_delay: Duration::from_secs(1),
        },
    };
    Harness {
        queue,
        store,
        backend,
        results,
        crypto,
        worker: Worker::new(0, ctx),
    }
}

fn harness() -> Harness {
    harness_with_retries(3)
}

fn png_bytes() -> Vec<u8> {
    let img = image::GrayImage::from_fn(8, 8, |x, y| image::Luma([(x * 8 + y) as u8 * 3]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

impl Harness {
    /// Enqueue a job and, unless `orphaned`, store its encrypted image.
    async fn submit(&self, orphaned: bool) -> Job {
        let job = Job::new(format!("photos/{}.enc", Uuid::new_v4()), Priority::Normal);
        if !orphaned {
            let encrypted = self.crypto.encrypt(&png_bytes()).unwrap();
            self.store
                .put(&job.image_key, &encrypted, "application/octet-stream")
                .await
                .unwrap();
        }
        self.queue.enqueue(job.clone()).await.unwrap();
        job
    }
}

fn lines(entries: &[(&str, f64)]) -> InferenceOutcome {
    InferenceOutcome::Lines(
        entries
            .iter()
            .map(|(text, confidence)| TextLine {
                text: text.to_string(),
                confidence: *confidence,
            })
            .collect(),
    )
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn well_formed_image_completes_with_extracted_address() {
    let h = harness();
    let job = h.submit(false).await;
    h.backend
        .push_batch(vec![lines(&[("68", 0.99), ("ORCHARD CLOSE", 0.97)])]);

    assert_eq!(h.worker.process_cycle().await.unwrap(), 1);

    let results = h.results.results.lock().unwrap();
    let result = results.get(&job.job_id).expect("result persisted");
    assert_eq!(result.street_number.as_deref(), Some("68"));
    assert_eq!(result.street_name.as_deref(), Some("ORCHARD CLOSE"));
    assert_eq!(result.unit_number, None);
    assert!(result.confidence >= 0.95);
    assert!(result.processing_time_seconds >= 0.0);
    drop(results);

    // Acked: nothing pending, nothing in flight, nothing dead-lettered.
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert!(h.queue.dequeue_batch(1, VISIBILITY).await.unwrap().is_empty());
    assert!(h.queue.drain_dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn partial_resolution_failures_share_one_inference_call() {
    let h = harness();
    let mut jobs = Vec::new();
    for i in 0..16 {
        jobs.push(h.submit(i < 3).await); // first 3 have no stored object
    }
    h.backend.push_batch(vec![lines(&[("68", 0.99)]); 13]);

    assert_eq!(h.worker.process_cycle().await.unwrap(), 16);

    // Exactly one inference call, holding only the 13 resolvable images.
    assert_eq!(h.backend.batch_sizes(), vec![13]);

    // The 3 unresolvable jobs are terminal IMAGE_NOT_FOUND dead letters.
    let records = h.queue.drain_dead_letters(20).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.reason == FailureReason::ImageNotFound));
    let orphaned: Vec<_> = jobs[..3].iter().map(|j| j.job_id).collect();
    assert!(records.iter().all(|r| orphaned.contains(&r.job_id)));

    // The rest completed.
    assert_eq!(h.results.results.lock().unwrap().len(), 13);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn backend_timeout_requeues_whole_batch_without_acks() {
    let h = harness();
    for _ in 0..4 {
        h.submit(false).await;
    }
    h.backend
        .push_batch(vec![InferenceOutcome::Failed(OutcomeFailure::Timeout); 4]);

    assert_eq!(h.worker.process_cycle().await.unwrap(), 4);

    // None persisted, none dead-lettered, all pending again.
    assert!(h.results.results.lock().unwrap().is_empty());
    assert!(h.queue.drain_dead_letters(10).await.unwrap().is_empty());
    assert_eq!(h.queue.depth().await.unwrap(), 4);

    // After the backoff delay every job is redelivered with retry_count 1.
    tokio::time::advance(Duration::from_secs(2)).await;
    let redelivered = h.queue.dequeue_batch(16, VISIBILITY).await.unwrap();
    assert_eq!(redelivered.len(), 4);
    assert!(redelivered.iter().all(|j| j.retry_count == 1));
}

#[tokio::test(start_paused = true)]
async fn low_confidence_result_is_requeued_not_persisted() {
    let h = harness();
    let job = h.submit(false).await;
    h.backend.push_batch(vec![lines(&[("68", 0.80)])]);

    assert_eq!(h.worker.process_cycle().await.unwrap(), 1);

    assert!(h.results.results.lock().unwrap().is_empty());
    assert_eq!(
        h.results.statuses.lock().unwrap().get(&job.job_id).map(String::as_str),
        Some("queued")
    );
    assert!(h.queue.drain_dead_letters(10).await.unwrap().is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    let redelivered = h.queue.dequeue_batch(1, VISIBILITY).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].job_id, job.job_id);
    assert_eq!(redelivered[0].retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn unparseable_text_is_terminal_malformed_result() {
    let h = harness();
    let job = h.submit(false).await;
    h.backend
        .push_batch(vec![lines(&[("Delivered", 0.99), ("Tracking", 0.99)])]);

    assert_eq!(h.worker.process_cycle().await.unwrap(), 1);

    let records = h.queue.drain_dead_letters(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, job.job_id);
    assert_eq!(records[0].reason, FailureReason::MalformedResult);
    assert!(h.results.results.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn outcomes_map_back_to_jobs_in_input_order() {
    let h = harness();
    let jobs = [
        h.submit(false).await,
        h.submit(false).await,
        h.submit(false).await,
        h.submit(false).await,
        h.submit(false).await,
    ];
    // Distinct street number per batch index.
    h.backend.push_batch(
        (1..=5).map(|i| lines(&[(format!("{i}").as_str(), 0.99)])).collect(),
    );

    assert_eq!(h.worker.process_cycle().await.unwrap(), 5);

    let results = h.results.results.lock().unwrap();
    for (i, job) in jobs.iter().enumerate() {
        let result = results.get(&job.job_id).expect("result persisted");
        assert_eq!(result.street_number.as_deref(), Some(format!("{}", i + 1).as_str()));
    }
}

#[tokio::test(start_paused = true)]
async fn persistent_backend_failure_exhausts_retries_into_dead_letter() {
    let h = harness_with_retries(1);
    let job = h.submit(false).await;

    h.backend
        .push_batch(vec![InferenceOutcome::Failed(OutcomeFailure::Timeout)]);
    assert_eq!(h.worker.process_cycle().await.unwrap(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    h.backend
        .push_batch(vec![InferenceOutcome::Failed(OutcomeFailure::Timeout)]);
    assert_eq!(h.worker.process_cycle().await.unwrap(), 1);

    // max_retries + 1 failed attempts: dead-lettered exactly once.
    let records = h.queue.drain_dead_letters(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, job.job_id);
    assert_eq!(records[0].attempt, 2);
    assert_eq!(
        h.results.statuses.lock().unwrap().get(&job.job_id).map(String::as_str),
        Some("dead_lettered")
    );

    // Never reprocessed afterward.
    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(h.queue.dequeue_batch(1, VISIBILITY).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn corrupt_input_is_terminal_for_that_job_only() {
    let h = harness();
    let bad = h.submit(false).await;
    let good = h.submit(false).await;
    h.backend.push_batch(vec![
        InferenceOutcome::Failed(OutcomeFailure::CorruptInput),
        lines(&[("68", 0.99), ("ORCHARD CLOSE", 0.97)]),
    ]);

    assert_eq!(h.worker.process_cycle().await.unwrap(), 2);

    let records = h.queue.drain_dead_letters(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, bad.job_id);
    assert_eq!(records[0].reason, FailureReason::InferenceError);
    assert!(h.results.results.lock().unwrap().contains_key(&good.job_id));
}

#[tokio::test(start_paused = true)]
async fn persistence_failure_leaves_job_for_visibility_recovery() {
    let h = harness();
    let job = h.submit(false).await;
    h.results.fail_persist.store(true, Ordering::SeqCst);
    h.backend
        .push_batch(vec![lines(&[("68", 0.99), ("ORCHARD CLOSE", 0.97)])]);

    assert_eq!(h.worker.process_cycle().await.unwrap(), 1);

    // Not acked, not requeued: the job stays in flight until its visibility
    // timeout expires.
    assert!(h.results.results.lock().unwrap().is_empty());
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert!(h.queue.dequeue_batch(1, VISIBILITY).await.unwrap().is_empty());

    // Once the store recovers, the redelivered job completes.
    h.results.fail_persist.store(false, Ordering::SeqCst);
    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    h.backend
        .push_batch(vec![lines(&[("68", 0.99), ("ORCHARD CLOSE", 0.97)])]);
    assert_eq!(h.worker.process_cycle().await.unwrap(), 1);
    assert!(h.results.results.lock().unwrap().contains_key(&job.job_id));
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}
