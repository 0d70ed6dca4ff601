//! V4L2 camera snapshots via the `v4l` crate.

use crate::frame::{self, FrameError};
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const DARK_FRAME_PCT: f32 = 0.95;
const EBUSY: i32 = 16;
const CANCEL_POLL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture cancelled")]
    Cancelled,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion-JPEG: each buffer is a complete JPEG image.
    Mjpeg,
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
}

/// How to decide the device is ready before taking the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Warmup {
    /// Frames to inspect for a non-dark image before giving up on the
    /// ready signal. Zero skips straight to the fixed delay.
    pub max_frames: usize,
    /// Fixed delay used when the ready signal never arrives.
    pub fallback_delay: Duration,
}

impl Default for Warmup {
    fn default() -> Self {
        Self {
            max_frames: 30,
            fallback_delay: Duration::from_millis(1000),
        }
    }
}

/// How the snapshot frame was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A non-dark frame arrived after this many discarded frames.
    Signalled { discarded: usize },
    /// No usable frame within the budget; captured after the fixed delay.
    Delayed,
}

/// One encoded still image from the camera.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// JPEG (MJPEG devices) or PNG (YUYV devices) bytes.
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub readiness: Readiness,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(device_path.to_string())
            }
            _ if e.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let pixel_format = negotiate(&device)?;
        let fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to read format: {e}")))?;

        tracing::info!(
            width = fmt.width,
            height = fmt.height,
            format = ?pixel_format,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: fmt.width,
            height: fmt.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Take one still once the device is ready.
    ///
    /// Pulls frames until one is not dark (auto-exposure has settled). If
    /// none qualifies within `warmup.max_frames`, sleeps the fixed delay
    /// and uses the next frame whatever it looks like.
    ///
    /// `cancel` is polled between frames and during the delay; once set,
    /// the stream is torn down and [`CameraError::Cancelled`] returned.
    pub fn snapshot(&self, warmup: &Warmup, cancel: &AtomicBool) -> Result<Snapshot, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        for discarded in 0..warmup.max_frames {
            check(cancel)?;
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
            let buf = used(buf, meta.bytesused);

            let image = match self.to_rgb(buf) {
                Ok(image) => image,
                Err(e) => {
                    // Truncated MJPEG frames are common right after stream-on.
                    tracing::debug!(seq = meta.sequence, error = %e, "skipping undecodable frame");
                    continue;
                }
            };
            if frame::is_dark(&image, DARK_FRAME_PCT) {
                tracing::debug!(seq = meta.sequence, "skipping dark frame");
                continue;
            }

            tracing::debug!(discarded, "camera ready");
            return self.encode(buf, image, Readiness::Signalled { discarded });
        }

        tracing::warn!(
            frames = warmup.max_frames,
            delay_ms = warmup.fallback_delay.as_millis() as u64,
            "no ready frame from camera; falling back to fixed warm-up delay"
        );
        pause(warmup.fallback_delay, cancel)?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let buf = used(buf, meta.bytesused);
        let image = self.to_rgb(buf)?;
        self.encode(buf, image, Readiness::Delayed)
    }

    fn to_rgb(&self, buf: &[u8]) -> Result<RgbImage, FrameError> {
        match self.pixel_format {
            PixelFormat::Mjpeg => frame::decode_mjpeg(buf),
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
        }
    }

    fn encode(&self, buf: &[u8], image: RgbImage, readiness: Readiness) -> Result<Snapshot, CameraError> {
        let bytes = match self.pixel_format {
            PixelFormat::Mjpeg => buf.to_vec(),
            PixelFormat::Yuyv => frame::encode_png(&image)?,
        };
        Ok(Snapshot {
            bytes,
            width: image.width(),
            height: image.height(),
            readiness,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

fn check(cancel: &AtomicBool) -> Result<(), CameraError> {
    if cancel.load(Ordering::Acquire) {
        Err(CameraError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleep for `delay` in short slices so a cancel is noticed promptly.
fn pause(delay: Duration, cancel: &AtomicBool) -> Result<(), CameraError> {
    let deadline = Instant::now() + delay;
    loop {
        check(cancel)?;
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(());
        }
        std::thread::sleep(left.min(CANCEL_POLL));
    }
}

/// Payload portion of a mapped buffer; drivers report 0 when unset.
fn used(buf: &[u8], bytesused: u32) -> &[u8] {
    match bytesused as usize {
        0 => buf,
        n => &buf[..n.min(buf.len())],
    }
}

/// Ask for MJPEG, then YUYV, at 640x480. Drivers may adjust the size.
fn negotiate(device: &Device) -> Result<PixelFormat, CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;

    for (fourcc, pixel_format) in [(b"MJPG", PixelFormat::Mjpeg), (b"YUYV", PixelFormat::Yuyv)] {
        fmt.fourcc = FourCC::new(fourcc);
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;
        match device.set_format(&fmt) {
            Ok(negotiated) if negotiated.fourcc == FourCC::new(fourcc) => return Ok(pixel_format),
            Ok(negotiated) => {
                tracing::debug!(wanted = ?FourCC::new(fourcc), got = ?negotiated.fourcc, "format not accepted");
            }
            Err(e) => tracing::debug!(wanted = ?FourCC::new(fourcc), error = %e, "set_format failed"),
        }
    }

    Err(CameraError::FormatNegotiationFailed(
        "device offers neither MJPG nor YUYV".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_trims_to_payload() {
        let buf = [1u8, 2, 3, 4, 5];
        assert_eq!(used(&buf, 3), &[1, 2, 3]);
        assert_eq!(used(&buf, 0), &buf);
        assert_eq!(used(&buf, 99), &buf);
    }

    #[test]
    fn test_pause_stops_on_cancel() {
        let cancel = AtomicBool::new(true);
        let started = Instant::now();
        assert!(matches!(
            pause(Duration::from_secs(5), &cancel),
            Err(CameraError::Cancelled)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        cancel.store(false, Ordering::Release);
        pause(Duration::from_millis(30), &cancel).unwrap();
    }

    #[test]
    fn test_open_missing_device() {
        assert!(matches!(
            Camera::open("/dev/facecheck-no-such-video"),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
