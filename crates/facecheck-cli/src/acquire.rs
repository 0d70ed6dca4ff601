//! Image acquisition: a file on disk or a camera snapshot, as encoded bytes.

use facecheck_hw::{Camera, CameraError, Readiness, Warmup};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    File(PathBuf),
    Camera { device: String },
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::File(path) => write!(f, "file {}", path.display()),
            ImageSource::Camera { device } => write!(f, "camera {device}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("cannot read {}: {source}", path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("camera capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("capture task failed: {0}")]
    Task(String),
}

/// Exclusive access to the camera across verifications.
///
/// A V4L2 device streams for one opener at a time. Each capture holds the
/// device lock until its blocking task returns, and starting a capture
/// cancels the one before it, so the newest request waits only as long as
/// the stale stream takes to notice.
#[derive(Clone, Default)]
pub struct CameraGate {
    device: Arc<tokio::sync::Mutex<()>>,
    current: Arc<Mutex<Arc<AtomicBool>>>,
}

impl CameraGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the in-flight capture, if any, to stop.
    pub fn cancel(&self) {
        self.flag().store(true, Ordering::Release);
    }

    /// Run `capture` on the blocking pool once the device is free.
    ///
    /// `timeout` covers the wait for the device and the capture itself. On
    /// timeout the capture is cancelled and keeps the device until it has
    /// actually stopped.
    pub async fn run<T, F>(&self, timeout: Duration, capture: F) -> Result<T, AcquireError>
    where
        T: Send + 'static,
        F: FnOnce(&AtomicBool) -> Result<T, CameraError> + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let previous = std::mem::replace(&mut *self.lock_current(), Arc::clone(&cancel));
        previous.store(true, Ordering::Release);

        let flag = Arc::clone(&cancel);
        let device = Arc::clone(&self.device);
        let work = async move {
            let guard = device.lock_owned().await;
            let task = tokio::task::spawn_blocking(move || {
                let _device = guard;
                capture(&flag)
            });
            match task.await {
                Ok(result) => result.map_err(AcquireError::from),
                Err(e) => Err(AcquireError::Task(e.to_string())),
            }
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                cancel.store(true, Ordering::Release);
                Err(AcquireError::Timeout(timeout))
            }
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.lock_current().clone()
    }

    fn lock_current(&self) -> MutexGuard<'_, Arc<AtomicBool>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Read the image bytes for `source`.
///
/// Camera capture is blocking V4L2 I/O and runs on the blocking pool,
/// serialized through `gate`.
pub async fn acquire(
    source: &ImageSource,
    warmup: Warmup,
    timeout: Duration,
    gate: &CameraGate,
) -> Result<Vec<u8>, AcquireError> {
    match source {
        ImageSource::File(path) => {
            tokio::fs::read(path)
                .await
                .map_err(|source| AcquireError::File {
                    path: path.clone(),
                    source,
                })
        }
        ImageSource::Camera { device } => {
            let device = device.clone();
            let snapshot = gate
                .run(timeout, move |cancel| {
                    let camera = Camera::open(&device)?;
                    camera.snapshot(&warmup, cancel)
                })
                .await?;

            if snapshot.readiness == Readiness::Delayed {
                tracing::warn!("camera never signalled ready; used fixed warm-up delay");
            }
            tracing::debug!(
                width = snapshot.width,
                height = snapshot.height,
                bytes = snapshot.bytes.len(),
                readiness = ?snapshot.readiness,
                "camera snapshot taken"
            );
            Ok(snapshot.bytes)
        }
    }
}
