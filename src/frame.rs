//! Camera frames.
//!
//! A `Frame` lives for one loop iteration: it is produced by a `FrameSource`,
//! borrowed by the detector, copied once into an annotated evidence frame when an
//! alert fires, and then dropped. Nothing in the crate keeps frames across
//! iterations.

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use std::fmt;
use std::time::{Duration, Instant};

use crate::detect::{BoundingBox, Detection};

/// Frames are always normalized to packed RGB8 at ingestion.
pub const RGB_CHANNELS: u8 = 3;

const BOX_COLOR: [u8; 3] = [0, 255, 0];
const BOX_THICKNESS: u32 = 2;

/// Packed RGB8 image with capture metadata.
#[derive(Clone)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture counter of the producing source.
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn channels(&self) -> u8 {
        RGB_CHANNELS
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Shrink frames wider than `max_width`, keeping the aspect ratio.
    pub fn downscale_to_width(self, max_width: u32) -> Result<Self> {
        if max_width == 0 || self.width <= max_width {
            return Ok(self);
        }
        let scale = max_width as f64 / self.width as f64;
        let new_height = ((self.height as f64 * scale).round() as u32).max(1);
        let resized = image::imageops::resize(
            &self.to_rgb_image()?,
            max_width,
            new_height,
            FilterType::Triangle,
        );
        Ok(Self {
            pixels: resized.into_raw(),
            width: max_width,
            height: new_height,
            sequence: self.sequence,
            captured_at: self.captured_at,
        })
    }

    /// Copy of this frame with one outline per detection.
    pub fn annotated(&self, detections: &[Detection]) -> Frame {
        let mut copy = self.clone();
        for detection in detections {
            draw_box(
                &mut copy.pixels,
                copy.width,
                copy.height,
                &detection.bbox,
                BOX_COLOR,
            );
        }
        copy
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        self.to_rgb_image()?
            .write_with_encoder(encoder)
            .context("encode evidence jpeg")?;
        Ok(out)
    }

    fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS as usize))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn draw_box(pixels: &mut [u8], width: u32, height: u32, bbox: &BoundingBox, color: [u8; 3]) {
    let Some((x0, y0, x1, y1)) = bbox.to_pixels(width, height) else {
        return;
    };
    for t in 0..BOX_THICKNESS {
        let top = (y0 + t).min(y1);
        let bottom = y1.saturating_sub(t).max(y0);
        let left = (x0 + t).min(x1);
        let right = x1.saturating_sub(t).max(x0);
        for x in x0..=x1 {
            put_pixel(pixels, width, x, top, color);
            put_pixel(pixels, width, x, bottom, color);
        }
        for y in y0..=y1 {
            put_pixel(pixels, width, left, y, color);
            put_pixel(pixels, width, right, y, color);
        }
    }
}

fn put_pixel(pixels: &mut [u8], width: u32, x: u32, y: u32, color: [u8; 3]) {
    let idx = (y as usize * width as usize + x as usize) * RGB_CHANNELS as usize;
    if let Some(slot) = pixels.get_mut(idx..idx + RGB_CHANNELS as usize) {
        slot.copy_from_slice(&color);
    }
}
