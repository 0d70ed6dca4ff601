use async_trait::async_trait;
use facecheck_core::{Detection, EmbeddingProvider, FaceEmbedder, ModelPaths, ProviderError};
use tokio::sync::{mpsc, oneshot};

/// Messages sent from verification tasks to the engine thread.
struct DetectRequest {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Option<Detection>, ProviderError>>,
}

/// Clone-safe handle to the inference thread.
#[derive(Clone)]
pub struct OnnxProvider {
    tx: mpsc::Sender<DetectRequest>,
}

#[async_trait]
impl EmbeddingProvider for OnnxProvider {
    async fn detect(&self, image: Vec<u8>) -> Result<Option<Detection>, ProviderError> {
        let closed = || ProviderError::Unavailable("inference thread exited".into());
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DetectRequest {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())?
    }
}

/// Spawn the inference engine on a dedicated OS thread.
///
/// Models are loaded on the first request, not here, so commands that
/// never run inference start instantly. A failed load is reported to that
/// request as `Unavailable` and retried on the next one.
pub fn spawn_engine(paths: ModelPaths) -> std::io::Result<OnnxProvider> {
    let (tx, mut rx) = mpsc::channel::<DetectRequest>(4);

    std::thread::Builder::new()
        .name("facecheck-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut embedder: Option<FaceEmbedder> = None;
            while let Some(req) = rx.blocking_recv() {
                // Requester already gave up (timeout or superseded).
                if req.reply.is_closed() {
                    tracing::debug!("skipping abandoned request");
                    continue;
                }
                let result = load(&mut embedder, &paths).and_then(|e| e.embed(&req.image));
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(OnnxProvider { tx })
}

fn load<'a>(slot: &'a mut Option<FaceEmbedder>, paths: &ModelPaths) -> Result<&'a mut FaceEmbedder, ProviderError> {
    if slot.is_none() {
        let embedder = FaceEmbedder::load(paths)?;
        tracing::info!(
            detector = %paths.detector.display(),
            recognizer = %paths.recognizer.display(),
            "face models loaded"
        );
        *slot = Some(embedder);
    }
    slot.as_mut()
        .ok_or_else(|| ProviderError::Unavailable("face models not loaded".into()))
}
