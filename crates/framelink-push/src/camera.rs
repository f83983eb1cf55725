//! Camera collaborator interface.
//!
//! Hardware access is out of scope for the core — the push client talks to
//! its camera through this narrow trait. [`TestPatternCamera`] is the
//! built-in implementation: a synthetic generator that lets the whole fabric
//! run end-to-end on machines without a capture device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use framelink_core::{CamConfig, Frame, FrameConfig, Timestamp, TransportError};
use framelink_transport::FrameSource;

/// External camera lifecycle, consumed by the stream-start/stop handlers.
#[async_trait]
pub trait CameraControl: Send + Sync {
    /// Power the camera up with the given tuning and geometry; returns the
    /// frame producer the send-side data protocol will drain.
    async fn start(
        &self,
        cam: &CamConfig,
        frame: &FrameConfig,
    ) -> Result<Box<dyn FrameSource>, TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    /// Apply a tuning change without restarting the pipeline.
    async fn reconfigure(&self, cam: &CamConfig) -> Result<(), TransportError>;
}

// ── TestPatternCamera ─────────────────────────────────────────────────────────

/// Synthetic camera: produces a scrolling gradient at the configured frame
/// rate. "Already started" is tracked so a second start is rejected, the
/// way a real device driver would refuse a busy sensor.
pub struct TestPatternCamera {
    started: AtomicBool,
}

impl TestPatternCamera {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
        }
    }
}

impl Default for TestPatternCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraControl for TestPatternCamera {
    async fn start(
        &self,
        cam: &CamConfig,
        frame: &FrameConfig,
    ) -> Result<Box<dyn FrameSource>, TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::other(
                "camera already started",
            )));
        }
        info!(
            "Test-pattern camera up: {}×{} @ {} fps (brightness {})",
            frame.width, frame.height, frame.fps, cam.brightness
        );
        Ok(Box::new(TestPatternSource {
            config: *frame,
            next_due: Instant::now(),
            seq: 0,
        }))
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.started.store(false, Ordering::SeqCst);
        info!("Test-pattern camera stopped");
        Ok(())
    }

    async fn reconfigure(&self, cam: &CamConfig) -> Result<(), TransportError> {
        info!(
            "Test-pattern camera retuned (brightness {}, exposure {})",
            cam.brightness, cam.exposure
        );
        Ok(())
    }
}

/// Paced synthetic frame producer.
struct TestPatternSource {
    config: FrameConfig,
    next_due: Instant,
    seq: u64,
}

#[async_trait]
impl FrameSource for TestPatternSource {
    async fn next_frame(&mut self, scratch: &mut Frame) -> Result<bool, TransportError> {
        if Instant::now() < self.next_due {
            return Ok(false);
        }
        self.next_due = Instant::now() + Duration::from_micros(self.config.frame_interval_us());

        let len = self.config.max_frame_len().min(scratch.data.len());
        let phase = (self.seq % 251) as u8;
        for (i, b) in scratch.data[..len].iter_mut().enumerate() {
            *b = phase.wrapping_add((i % 256) as u8);
        }
        scratch.meta = framelink_core::FrameMeta {
            len,
            width: self.config.width,
            height: self.config.height,
            format: self.config.format,
            timestamp: Timestamp::now(),
        };
        self.seq += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::PixelFormat;

    #[tokio::test]
    async fn double_start_is_refused() {
        let cam = TestPatternCamera::new();
        let cfg = FrameConfig::default();
        let _src = cam.start(&CamConfig::default(), &cfg).await.unwrap();
        assert!(cam.start(&CamConfig::default(), &cfg).await.is_err());

        cam.stop().await.unwrap();
        assert!(cam.start(&CamConfig::default(), &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn source_paces_to_frame_interval() {
        let cam = TestPatternCamera::new();
        let cfg = FrameConfig {
            width: 16,
            height: 16,
            format: PixelFormat::Yuyv,
            fps: 30,
        };
        let mut src = cam.start(&CamConfig::default(), &cfg).await.unwrap();
        let mut scratch = Frame::scratch(cfg.max_frame_len(), cfg.format);

        assert!(src.next_frame(&mut scratch).await.unwrap());
        assert_eq!(scratch.meta.len, 16 * 16 * 2);
        // Immediately asking again lands inside the pacing window
        assert!(!src.next_frame(&mut scratch).await.unwrap());
    }
}
