//! Camera frame sources.
//!
//! - Synthetic source (`stub://` URLs) for bench runs and tests
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! All sources produce RGB8 `Frame`s. The detection loop owns the single active
//! source and ties its start/stop to mode transitions.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::Result;
use std::time::Duration;
use thiserror::Error;

use crate::frame::Frame;

pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

#[derive(Debug, Error)]
#[error("camera {device} failed to start: {reason}")]
pub struct CameraError {
    pub device: String,
    pub reason: String,
}

/// Transient capture failure. Never fatal to the loop.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera is not started")]
    NotStarted,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("frame read failed: {0}")]
    Read(String),
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub starts: u64,
}

/// Camera contract used by the detection loop.
///
/// `stop` must be safe to call repeatedly and on a source that never started.
pub trait FrameSource: Send {
    /// Device or URL, for logs.
    fn describe(&self) -> String;

    fn start(&mut self) -> Result<(), CameraError>;

    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Configuration for the camera.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraConfig {
    /// Device path (e.g. "/dev/video0") or `stub://name?width=&height=&fail_every=`.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// Upper bound on a single blocking capture.
    pub capture_timeout: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
            capture_timeout: Duration::from_secs(2),
        }
    }
}

/// Build the configured source. Fails when the device cannot be used at all,
/// which the daemon treats as fatal at startup.
pub fn open_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    if config.device.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())?));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(config.clone())?))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        anyhow::bail!(
            "camera {} requires the ingest-v4l2 feature",
            config.device
        )
    }
}
