//! V4L2 frame source.
//!
//! Opens a local device node (e.g. /dev/video0) on `start` and closes it on
//! `stop`, so an idle sentinel holds no camera handle. Frames are captured into
//! memory and normalized to RGB8.

use anyhow::{anyhow, Result};
use ouroboros::self_referencing;
use std::path::Path;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CameraConfig, CameraError, CaptureError, FrameSource, SourceStats};
use crate::frame::Frame;

pub struct V4l2Source {
    config: CameraConfig,
    state: Option<DeviceV4l2State>,
    active_width: u32,
    active_height: u32,
    pixel_format: PixelFormat,
    stats: SourceStats,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    /// Fails when the device node does not exist.
    pub fn new(config: CameraConfig) -> Result<Self> {
        if !Path::new(&config.device).exists() {
            return Err(anyhow!("camera device {} does not exist", config.device));
        }
        Ok(Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            pixel_format: PixelFormat::Rgb24,
            stats: SourceStats::default(),
        })
    }

    fn open(&mut self) -> Result<DeviceV4l2State> {
        use anyhow::Context;
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "camera {}: RGB3 rejected ({}), trying YUYV",
                    self.config.device,
                    err
                );
                format.fourcc = v4l::FourCC::new(b"YUYV");
                device.set_format(&format).context("set v4l2 format")?
            }
        };
        self.pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "camera {} negotiated unsupported format {}",
                self.config.device,
                format.fourcc
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("camera {}: failed to set fps: {}", self.config.device, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let timeout = self.config.capture_timeout;
        DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map(|mut stream| {
                        stream.set_timeout(timeout);
                        stream
                    })
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        self.config.device.clone()
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if self.state.is_some() {
            return Ok(());
        }
        let state = self.open().map_err(|err| CameraError {
            device: self.config.device.clone(),
            reason: format!("{:#}", err),
        })?;
        self.state = Some(state);
        self.stats.starts += 1;
        log::info!(
            "camera {} started ({}x{}, {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.pixel_format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().ok_or(CaptureError::NotStarted)?;
        let raw = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| {
                self.stats.capture_failures += 1;
                if err.kind() == std::io::ErrorKind::TimedOut {
                    CaptureError::Timeout(self.config.capture_timeout)
                } else {
                    CaptureError::Read(err.to_string())
                }
            })?;

        let pixels = normalize_to_rgb(
            &raw,
            self.active_width,
            self.active_height,
            self.pixel_format,
        )
        .map_err(|err| {
            self.stats.capture_failures += 1;
            CaptureError::Read(err.to_string())
        })?;

        self.stats.frames_captured += 1;
        Frame::from_rgb(
            pixels,
            self.active_width,
            self.active_height,
            self.stats.frames_captured,
        )
        .map_err(|err| CaptureError::Read(err.to_string()))
    }

    fn stop(&mut self) {
        if self.state.take().is_some() {
            log::info!("camera {} stopped", self.config.device);
        }
    }

    fn is_running(&self) -> bool {
        self.state.is_some()
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_rejected() {
        let config = CameraConfig {
            device: "/dev/does-not-exist-video99".to_string(),
            ..CameraConfig::default()
        };
        assert!(V4l2Source::new(config).is_err());
    }
}
