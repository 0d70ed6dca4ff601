//! Image bytes in, single face embedding out.

use crate::detector::FaceDetector;
use crate::provider::ProviderError;
use crate::recognizer::FaceRecognizer;
use crate::types::Detection;
use std::path::{Path, PathBuf};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Locations of the two ONNX model files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(SCRFD_MODEL_FILE),
            recognizer: dir.join(ARCFACE_MODEL_FILE),
        }
    }

    pub fn all_present(&self) -> bool {
        self.detector.exists() && self.recognizer.exists()
    }
}

/// Detector and recognizer loaded together.
pub struct FaceEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceEmbedder {
    /// Load both models. Any failure here means the provider is unavailable.
    pub fn load(paths: &ModelPaths) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(&paths.detector.to_string_lossy())
            .map_err(|e| ProviderError::Unavailable(format!("detector: {e}")))?;
        let recognizer = FaceRecognizer::load(&paths.recognizer.to_string_lossy())
            .map_err(|e| ProviderError::Unavailable(format!("recognizer: {e}")))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }

    /// Decode `image`, keep the most confident face, and embed it.
    pub fn embed(&mut self, image: &[u8]) -> Result<Option<Detection>, ProviderError> {
        let rgb = image::load_from_memory(image)
            .map_err(|e| ProviderError::InvalidImage(e.to_string()))?
            .to_rgb8();

        let faces = self
            .detector
            .detect(&rgb)
            .map_err(|e| ProviderError::Inference(format!("detector: {e}")))?;
        tracing::debug!(faces = faces.len(), width = rgb.width(), height = rgb.height(), "detection done");

        let Some(face) = faces.into_iter().next() else {
            return Ok(None);
        };

        let embedding = self
            .recognizer
            .extract(&rgb, &face)
            .map_err(|e| ProviderError::Inference(format!("recognizer: {e}")))?;

        Ok(Some(Detection { embedding, face }))
    }
}
