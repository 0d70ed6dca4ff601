//! Verification workflow.
//!
//! One verification runs the stages
//! `Detecting -> (NoFace | Fetching -> Matching -> [Persisting]) -> Done | Failed`
//! and publishes its outcome on a `watch` channel. Every verification takes
//! a generation ticket; a newer one supersedes it. After each suspension
//! point the workflow checks its ticket and stops with
//! [`VerifyError::Superseded`] if it is stale. A superseded workflow never
//! touches the status channel and never appends to the store.

use crate::acquire::{self, AcquireError, CameraGate, ImageSource};
use facecheck_core::{
    Embedding, EmbeddingProvider, EmbeddingStore, MatchError, MatchOutcome, MatchStrategy,
    ProviderError,
};
use facecheck_hw::Warmup;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// What the user sees: one current value, replaced as verifications finish.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Status {
    #[default]
    Idle,
    Processing,
    Matched,
    NoMatch,
    NoFaceDetected,
    Error(String),
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Idle => write!(f, "idle"),
            Status::Processing => write!(f, "processing"),
            Status::Matched => write!(f, "matched"),
            Status::NoMatch => write!(f, "no match"),
            Status::NoFaceDetected => write!(f, "no face detected"),
            Status::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acquiring,
    Detecting,
    NoFace,
    Fetching,
    Matching,
    Persisting,
    Done,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Acquiring => "acquiring",
            Stage::Detecting => "detecting",
            Stage::NoFace => "no-face",
            Stage::Fetching => "fetching",
            Stage::Matching => "matching",
            Stage::Persisting => "persisting",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Matched,
    NoMatch,
    NoFaceDetected,
}

impl From<Verdict> for Status {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Matched => Status::Matched,
            Verdict::NoMatch => Status::NoMatch,
            Verdict::NoFaceDetected => Status::NoFaceDetected,
        }
    }
}

/// Result of one completed verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub verdict: Verdict,
    /// Store id of the matching record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_id: Option<String>,
    /// Distance to the matching record, or to the closest one seen on no match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    /// Id of the record appended for an unknown face.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_id: Option<String>,
    /// Detector confidence of the face used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub candidates: usize,
    /// Set when an unknown face could not be written back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_warning: Option<String>,
}

impl Report {
    /// One-line human-readable outcome.
    pub fn summary(&self) -> String {
        match self.verdict {
            Verdict::NoFaceDetected => "no face detected".to_string(),
            Verdict::Matched => format!(
                "matched record {} (distance {:.3})",
                self.matched_id.as_deref().unwrap_or("?"),
                self.distance.unwrap_or(f32::NAN)
            ),
            Verdict::NoMatch => {
                let mut line = String::from("no match");
                if let Some(closest) = self.distance {
                    line.push_str(&format!(" (closest {closest:.3})"));
                }
                if let Some(id) = &self.stored_id {
                    line.push_str(&format!("; stored as {id}"));
                }
                line
            }
        }
    }

    fn no_face() -> Self {
        Self {
            verdict: Verdict::NoFaceDetected,
            matched_id: None,
            distance: None,
            stored_id: None,
            confidence: None,
            candidates: 0,
            persist_warning: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("face models unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("cannot read image: {0}")]
    ImageRead(String),
    #[error("capture device failure: {0}")]
    CaptureDeviceFailure(String),
    #[error("store read failed: {0}")]
    StoreReadFailure(String),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("{0} timed out after {1:?}")]
    Timeout(Stage, Duration),
    #[error("superseded by a newer verification")]
    Superseded,
}

impl From<ProviderError> for VerifyError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unavailable(msg) => VerifyError::ProviderUnavailable(msg),
            ProviderError::InvalidImage(msg) => VerifyError::InvalidImage(msg),
            ProviderError::Inference(msg) => VerifyError::Inference(msg),
        }
    }
}

impl From<AcquireError> for VerifyError {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::File { .. } => VerifyError::ImageRead(e.to_string()),
            AcquireError::Timeout(after) => VerifyError::Timeout(Stage::Acquiring, after),
            AcquireError::Camera(_) | AcquireError::Task(_) => {
                VerifyError::CaptureDeviceFailure(e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub capture: Duration,
    /// Includes lazy model loading on first use.
    pub detect: Duration,
    pub store_read: Duration,
    pub store_write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            capture: Duration::from_secs(10),
            detect: Duration::from_secs(30),
            store_read: Duration::from_secs(10),
            store_write: Duration::from_secs(10),
        }
    }
}

/// Per-process verification settings.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub threshold: f32,
    pub strategy: MatchStrategy,
    pub timeouts: Timeouts,
    pub warmup: Warmup,
}

pub struct Verifier<P, S> {
    provider: P,
    store: S,
    settings: Settings,
    camera: CameraGate,
    generation: AtomicU64,
    status: watch::Sender<Status>,
}

impl<P, S> Verifier<P, S>
where
    P: EmbeddingProvider,
    S: EmbeddingStore,
{
    pub fn new(provider: P, store: S, settings: Settings) -> Self {
        let (status, _) = watch::channel(Status::Idle);
        Self {
            provider,
            store,
            settings,
            camera: CameraGate::new(),
            generation: AtomicU64::new(0),
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Verify an already-encoded image.
    pub async fn verify(&self, image: Vec<u8>) -> Result<Report, VerifyError> {
        let ticket = self.begin();
        let result = self.run(ticket, image).await;
        self.finish(ticket, result)
    }

    /// Acquire an image from `source`, then verify it.
    pub async fn verify_source(&self, source: &ImageSource) -> Result<Report, VerifyError> {
        let ticket = self.begin();
        let result = self.acquire_and_run(ticket, source).await;
        self.finish(ticket, result)
    }

    async fn acquire_and_run(
        &self,
        ticket: u64,
        source: &ImageSource,
    ) -> Result<Report, VerifyError> {
        self.transition(ticket, Stage::Acquiring);
        let acquired = acquire::acquire(
            source,
            self.settings.warmup,
            self.settings.timeouts.capture,
            &self.camera,
        )
        .await;
        // A capture cancelled by a newer request surfaces as superseded.
        self.checkpoint(ticket)?;
        let image = acquired?;
        self.run(ticket, image).await
    }

    async fn run(&self, ticket: u64, image: Vec<u8>) -> Result<Report, VerifyError> {
        self.transition(ticket, Stage::Detecting);
        let detection = timed(
            Stage::Detecting,
            self.settings.timeouts.detect,
            self.provider.detect(image),
        )
        .await??;
        self.checkpoint(ticket)?;

        let Some(detection) = detection else {
            self.transition(ticket, Stage::NoFace);
            return Ok(Report::no_face());
        };
        let confidence = detection.face.confidence;

        self.transition(ticket, Stage::Fetching);
        let records = timed(
            Stage::Fetching,
            self.settings.timeouts.store_read,
            self.store.list_all(),
        )
        .await?
        .map_err(|e| VerifyError::StoreReadFailure(e.to_string()))?;
        self.checkpoint(ticket)?;

        self.transition(ticket, Stage::Matching);
        let outcome = self.settings.strategy.evaluate(
            &detection.embedding,
            records.iter().map(|r| &r.embedding),
            self.settings.threshold,
        )?;
        tracing::debug!(ticket, candidates = records.len(), ?outcome, "match evaluated");

        let closest = match outcome {
            MatchOutcome::Matched { index, distance } => {
                return Ok(Report {
                    verdict: Verdict::Matched,
                    matched_id: records.get(index).map(|r| r.id.clone()),
                    distance: Some(distance),
                    stored_id: None,
                    confidence: Some(confidence),
                    candidates: records.len(),
                    persist_warning: None,
                });
            }
            MatchOutcome::NoMatch { closest } => closest,
        };

        self.checkpoint(ticket)?;
        self.transition(ticket, Stage::Persisting);
        let (stored_id, persist_warning) = self.persist(detection.embedding).await;
        self.checkpoint(ticket)?;

        Ok(Report {
            verdict: Verdict::NoMatch,
            matched_id: None,
            distance: closest,
            stored_id,
            confidence: Some(confidence),
            candidates: records.len(),
            persist_warning,
        })
    }

    /// Append an unknown face. Failure is a warning, not an error.
    async fn persist(&self, embedding: Embedding) -> (Option<String>, Option<String>) {
        let timeout = self.settings.timeouts.store_write;
        match tokio::time::timeout(timeout, self.store.append(embedding)).await {
            Ok(Ok(record)) => {
                tracing::info!(id = %record.id, backend = self.store.backend(), "stored new face");
                (Some(record.id), None)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to persist embedding");
                (None, Some(format!("failed to persist embedding: {e}")))
            }
            Err(_) => {
                tracing::warn!(?timeout, "persisting embedding timed out");
                (None, Some(format!("failed to persist embedding: timed out after {timeout:?}")))
            }
        }
    }

    /// Take a new ticket and mark the surface as processing.
    ///
    /// The generation is bumped while the channel's write lock is held, so
    /// a stale workflow's [`Self::publish`] can never land after it. Any
    /// camera capture still running for an older ticket is cancelled.
    fn begin(&self) -> u64 {
        self.camera.cancel();
        let mut ticket = 0;
        self.status.send_modify(|status| {
            ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *status = Status::Processing;
        });
        tracing::debug!(ticket, "verification started");
        ticket
    }

    fn is_current(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }

    fn checkpoint(&self, ticket: u64) -> Result<(), VerifyError> {
        if self.is_current(ticket) {
            Ok(())
        } else {
            Err(VerifyError::Superseded)
        }
    }

    fn publish(&self, ticket: u64, next: Status) -> bool {
        self.status.send_if_modified(|current| {
            if !self.is_current(ticket) || *current == next {
                return false;
            }
            *current = next.clone();
            true
        })
    }

    fn transition(&self, ticket: u64, stage: Stage) {
        tracing::debug!(ticket, %stage, "workflow transition");
    }

    fn finish(&self, ticket: u64, result: Result<Report, VerifyError>) -> Result<Report, VerifyError> {
        match &result {
            Ok(report) => {
                self.transition(ticket, Stage::Done);
                self.publish(ticket, report.verdict.into());
            }
            Err(VerifyError::Superseded) => {
                tracing::debug!(ticket, "verification superseded");
            }
            Err(e) => {
                self.transition(ticket, Stage::Failed);
                tracing::warn!(ticket, error = %e, "verification failed");
                self.publish(ticket, Status::Error(e.to_string()));
            }
        }
        result
    }
}

async fn timed<T>(stage: Stage, limit: Duration, fut: impl Future<Output = T>) -> Result<T, VerifyError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| VerifyError::Timeout(stage, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use facecheck_core::{BoundingBox, Detection, StoredRecord};
    use facecheck_store::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Returns a fixed face for any image, except a few magic payloads.
    struct FakeProvider;

    fn query() -> Embedding {
        Embedding::new(vec![0.0, 0.0, 0.0, 0.0])
    }

    fn at_distance(d: f32) -> Embedding {
        Embedding::new(vec![d, 0.0, 0.0, 0.0])
    }

    fn face() -> Detection {
        Detection {
            embedding: query(),
            face: BoundingBox {
                x: 10.0,
                y: 10.0,
                width: 100.0,
                height: 120.0,
                confidence: 0.93,
                landmarks: None,
            },
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        async fn detect(&self, image: Vec<u8>) -> Result<Option<Detection>, ProviderError> {
            match image.as_slice() {
                b"noface" => Ok(None),
                b"unavailable" => Err(ProviderError::Unavailable("model files missing".into())),
                b"garbage" => Err(ProviderError::InvalidImage("unrecognized format".into())),
                b"slow" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(Some(face()))
                }
                b"hang" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Some(face()))
                }
                _ => Ok(Some(face())),
            }
        }
    }

    /// Store whose reads and/or writes fail, counting append attempts.
    struct BrokenStore {
        fail_read: bool,
        appends: AtomicUsize,
    }

    impl BrokenStore {
        fn new(fail_read: bool) -> Self {
            Self {
                fail_read,
                appends: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingStore for BrokenStore {
        type Error = std::io::Error;

        fn backend(&self) -> &'static str {
            "broken"
        }

        async fn list_all(&self) -> Result<Vec<StoredRecord>, std::io::Error> {
            if self.fail_read {
                Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "store offline"))
            } else {
                Ok(Vec::new())
            }
        }

        async fn append(&self, _embedding: Embedding) -> Result<StoredRecord, std::io::Error> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"))
        }
    }

    fn settings() -> Settings {
        Settings {
            threshold: 0.6,
            strategy: MatchStrategy::First,
            timeouts: Timeouts::default(),
            warmup: Warmup::default(),
        }
    }

    fn verifier<S: EmbeddingStore>(store: S) -> Verifier<FakeProvider, S> {
        Verifier::new(FakeProvider, store, settings())
    }

    #[tokio::test]
    async fn test_no_face_leaves_store_untouched() {
        let v = verifier(MemoryStore::with_embeddings([at_distance(0.3)]));
        let report = v.verify(b"noface".to_vec()).await.unwrap();
        assert_eq!(report.verdict, Verdict::NoFaceDetected);
        assert_eq!(v.store().len(), 1);
        assert_eq!(v.status(), Status::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_empty_store_stores_query() {
        let v = verifier(MemoryStore::new());
        let report = v.verify(b"face".to_vec()).await.unwrap();
        assert_eq!(report.verdict, Verdict::NoMatch);
        assert_eq!(report.stored_id.as_deref(), Some("mem-1"));
        assert_eq!(report.distance, None);

        let stored = v.store().snapshot();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].embedding, query());
        assert_eq!(v.status(), Status::NoMatch);
    }

    #[tokio::test]
    async fn test_close_face_matches_without_writing() {
        let v = verifier(MemoryStore::with_embeddings([at_distance(0.3)]));
        let report = v.verify(b"face".to_vec()).await.unwrap();
        assert_eq!(report.verdict, Verdict::Matched);
        assert_eq!(report.matched_id.as_deref(), Some("mem-1"));
        assert!((report.distance.unwrap() - 0.3).abs() < 1e-6);
        assert_eq!(report.confidence, Some(0.93));
        assert_eq!(v.store().len(), 1);
        assert_eq!(v.status(), Status::Matched);
    }

    #[tokio::test]
    async fn test_far_face_is_stored() {
        let v = verifier(MemoryStore::with_embeddings([at_distance(0.9)]));
        let report = v.verify(b"face".to_vec()).await.unwrap();
        assert_eq!(report.verdict, Verdict::NoMatch);
        assert_eq!(report.candidates, 1);
        assert!((report.distance.unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(v.store().len(), 2);
        assert_eq!(v.store().snapshot()[1].embedding, query());
    }

    #[tokio::test]
    async fn test_store_read_failure_skips_append() {
        let v = verifier(BrokenStore::new(true));
        let err = v.verify(b"face".to_vec()).await.unwrap_err();
        assert!(matches!(err, VerifyError::StoreReadFailure(_)), "{err}");
        assert_eq!(v.store().appends.load(Ordering::SeqCst), 0);
        assert!(matches!(v.status(), Status::Error(msg) if msg.contains("store read failed")));
    }

    #[tokio::test]
    async fn test_append_failure_is_a_warning() {
        let v = verifier(BrokenStore::new(false));
        let report = v.verify(b"face".to_vec()).await.unwrap();
        assert_eq!(report.verdict, Verdict::NoMatch);
        assert_eq!(report.stored_id, None);
        assert!(report.persist_warning.unwrap().contains("read-only"));
        assert_eq!(v.store().appends.load(Ordering::SeqCst), 1);
        assert_eq!(v.status(), Status::NoMatch);
    }

    #[tokio::test]
    async fn test_provider_unavailable_is_not_no_face() {
        let v = verifier(MemoryStore::new());
        let err = v.verify(b"unavailable".to_vec()).await.unwrap_err();
        assert!(matches!(err, VerifyError::ProviderUnavailable(_)), "{err}");
        assert!(v.store().is_empty());

        let err = v.verify(b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, VerifyError::InvalidImage(_)), "{err}");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_fails_request() {
        let v = verifier(MemoryStore::with_embeddings([Embedding::new(vec![0.0; 8])]));
        let err = v.verify(b"face".to_vec()).await.unwrap_err();
        assert!(
            matches!(err, VerifyError::Match(MatchError::DimensionMismatch { .. })),
            "{err}"
        );
        assert_eq!(v.store().len(), 1);
    }

    #[tokio::test]
    async fn test_detection_timeout_names_stage() {
        let mut s = settings();
        s.timeouts.detect = Duration::from_millis(50);
        let v = Verifier::new(FakeProvider, MemoryStore::new(), s);

        let err = v.verify(b"hang".to_vec()).await.unwrap_err();
        assert!(matches!(err, VerifyError::Timeout(Stage::Detecting, _)), "{err}");
        assert!(v.store().is_empty());
    }

    #[tokio::test]
    async fn test_superseded_run_neither_appends_nor_publishes() {
        let v = Arc::new(verifier(MemoryStore::new()));
        let mut rx = v.subscribe();

        let slow = {
            let v = Arc::clone(&v);
            tokio::spawn(async move { v.verify(b"slow".to_vec()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = v.verify(b"noface".to_vec()).await.unwrap();
        assert_eq!(report.verdict, Verdict::NoFaceDetected);

        let err = slow.await.unwrap().unwrap_err();
        assert_eq!(err, VerifyError::Superseded);
        assert!(v.store().is_empty());
        assert_eq!(*rx.borrow_and_update(), Status::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_new_verification_cancels_stale_capture() {
        let v = Arc::new(verifier(MemoryStore::new()));
        let capture = {
            let v = Arc::clone(&v);
            tokio::spawn(async move {
                v.camera
                    .run(Duration::from_secs(10), |cancel: &std::sync::atomic::AtomicBool| {
                        for _ in 0..500 {
                            if cancel.load(Ordering::Acquire) {
                                return Err(facecheck_hw::CameraError::Cancelled);
                            }
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = v.verify(b"noface".to_vec()).await.unwrap();
        assert_eq!(report.verdict, Verdict::NoFaceDetected);
        let err = capture.await.unwrap().unwrap_err();
        assert!(
            matches!(err, AcquireError::Camera(facecheck_hw::CameraError::Cancelled)),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_missing_file_source() {
        let v = verifier(MemoryStore::new());
        let source = ImageSource::File("/nonexistent/face.png".into());
        let err = v.verify_source(&source).await.unwrap_err();
        assert!(matches!(err, VerifyError::ImageRead(_)), "{err}");
    }

    #[test]
    fn test_summary_lines() {
        assert_eq!(Report::no_face().summary(), "no face detected");
        let report = Report {
            verdict: Verdict::NoMatch,
            matched_id: None,
            distance: Some(0.9),
            stored_id: Some("7".into()),
            confidence: Some(0.8),
            candidates: 1,
            persist_warning: None,
        };
        assert_eq!(report.summary(), "no match (closest 0.900); stored as 7");
    }

    #[test]
    fn test_report_json_omits_empty_fields() {
        let json = serde_json::to_value(Report::no_face()).unwrap();
        assert_eq!(json, serde_json::json!({"verdict": "no_face_detected", "candidates": 0}));
    }
}
