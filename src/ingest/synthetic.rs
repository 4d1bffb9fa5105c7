//! Synthetic frame source.
//!
//! `stub://<name>` produces generated RGB frames without touching hardware.
//! Query parameters tune it:
//! - `width`, `height`: frame size (defaults from `CameraConfig`)
//! - `fail_every`: every Nth capture fails, to exercise recovery paths

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{CameraConfig, CameraError, CaptureError, FrameSource, SourceStats};
use crate::frame::Frame;

/// Largest generated frame side.
const MAX_SIDE: u32 = 8192;

pub struct SyntheticSource {
    device: String,
    width: u32,
    height: u32,
    frame_len: usize,
    fail_every: Option<u64>,
    running: bool,
    attempts: u64,
    /// Simulated scene state; changes periodically to vary content.
    scene_state: u8,
    stats: SourceStats,
}

impl SyntheticSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        let url = Url::parse(&config.device).context("parse synthetic camera url")?;
        if url.scheme() != "stub" {
            return Err(anyhow!(
                "synthetic source expects a stub:// url, got {}",
                config.device
            ));
        }

        let mut width = config.width;
        let mut height = config.height;
        let mut fail_every = None;
        for (key, value) in url.query_pairs() {
            let parsed: u64 = value
                .parse()
                .map_err(|_| anyhow!("stub camera parameter {}={} is not a number", key, value))?;
            match key.as_ref() {
                "width" => width = side(&key, parsed)?,
                "height" => height = side(&key, parsed)?,
                "fail_every" if parsed > 0 => fail_every = Some(parsed),
                "fail_every" => fail_every = None,
                other => return Err(anyhow!("unknown stub camera parameter '{}'", other)),
            }
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("stub camera size must be non-zero"));
        }
        if width > MAX_SIDE || height > MAX_SIDE {
            return Err(anyhow!(
                "stub camera size {}x{} exceeds {}x{}",
                width,
                height,
                MAX_SIDE,
                MAX_SIDE
            ));
        }
        let frame_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|len| len.checked_mul(3))
            .ok_or_else(|| anyhow!("stub camera size {}x{} overflows", width, height))?;

        Ok(Self {
            device: config.device,
            width,
            height,
            frame_len,
            fail_every,
            running: false,
            attempts: 0,
            scene_state: 0,
            stats: SourceStats::default(),
        })
    }

    /// Generate synthetic pixel data.
    ///
    /// Mostly a static pattern; the scene changes every 50 frames.
    fn generate_pixels(&mut self) -> Vec<u8> {
        let frame_count = self.stats.frames_captured;
        if frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; self.frame_len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

fn side(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("stub camera {} {} is out of range", key, value))
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        self.device.clone()
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if !self.running {
            self.running = true;
            self.stats.starts += 1;
            log::info!(
                "camera {} started ({}x{}, synthetic)",
                self.device,
                self.width,
                self.height
            );
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.running {
            return Err(CaptureError::NotStarted);
        }
        self.attempts += 1;
        if self
            .fail_every
            .is_some_and(|every| self.attempts % every == 0)
        {
            self.stats.capture_failures += 1;
            return Err(CaptureError::Read("synthetic dropped frame".to_string()));
        }

        let pixels = self.generate_pixels();
        self.stats.frames_captured += 1;
        Frame::from_rgb(pixels, self.width, self.height, self.stats.frames_captured)
            .map_err(|e| CaptureError::Read(e.to_string()))
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            log::info!("camera {} stopped", self.device);
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}
