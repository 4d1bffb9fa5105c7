use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::detect::backend::{Detector, LoadError, ModelAsset, ModelLoader, Thresholds};
use crate::detect::nms::filter_detections;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;
use crate::mode::Species;

/// Roughly one frame in eight produces detections.
const DETECTION_BYTE_CUTOFF: u8 = 32;

/// Model produced by `StubLoader`.
#[derive(Clone, Debug, PartialEq)]
pub struct StubModel {
    pub species: Species,
    pub labels: Vec<String>,
}

/// Loader for deployments and tests without an inference runtime.
///
/// With a models directory it still requires `<species>.onnx` to exist, so a
/// missing asset behaves exactly as with a real backend.
#[derive(Clone, Debug, Default)]
pub struct StubLoader {
    models_dir: Option<PathBuf>,
}

impl StubLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: Some(dir.into()),
        }
    }
}

impl ModelLoader for StubLoader {
    type Model = StubModel;

    fn name(&self) -> &'static str {
        "stub"
    }

    fn load(&mut self, species: &Species) -> Result<StubModel, LoadError> {
        let labels = match &self.models_dir {
            Some(dir) => ModelAsset::locate(dir, species)?.labels,
            None => vec![species.to_string()],
        };
        Ok(StubModel {
            species: species.clone(),
            labels,
        })
    }
}

/// Deterministic detector: detections are derived from a hash of the pixels.
#[derive(Clone, Debug, Default)]
pub struct StubDetector;

impl StubDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Detector for StubDetector {
    type Model = StubModel;

    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(
        &mut self,
        model: &StubModel,
        frame: &Frame,
        thresholds: &Thresholds,
    ) -> Result<Vec<Detection>> {
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();
        if digest[0] >= DETECTION_BYTE_CUTOFF || model.labels.is_empty() {
            return Ok(Vec::new());
        }

        let count = 1 + (digest[1] % 3) as usize;
        let detections = (0..count)
            .map(|i| {
                let seed = &digest[2 + i * 6..8 + i * 6];
                Detection {
                    class_label: model.labels[seed[0] as usize % model.labels.len()].clone(),
                    confidence: 0.5 + seed[1] as f32 / 510.0,
                    bbox: BoundingBox {
                        x: seed[2] as f32 / 512.0,
                        y: seed[3] as f32 / 512.0,
                        w: 0.1 + seed[4] as f32 / 1024.0,
                        h: 0.1 + seed[5] as f32 / 1024.0,
                    },
                }
            })
            .collect();

        Ok(filter_detections(
            detections,
            thresholds.confidence,
            thresholds.overlap,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seed: u8) -> Frame {
        let pixels = (0..16 * 16 * 3)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect();
        Frame::from_rgb(pixels, 16, 16, seed as u64).unwrap()
    }

    #[test]
    fn loader_without_dir_uses_species_label() {
        let mut loader = StubLoader::new();
        let model = loader.load(&Species::new("terns").unwrap()).unwrap();
        assert_eq!(model.labels, vec!["terns".to_string()]);
    }

    #[test]
    fn loader_with_dir_requires_asset() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = StubLoader::with_models_dir(dir.path());
        assert!(loader.load(&Species::new("terns").unwrap()).is_err());

        std::fs::write(dir.path().join("terns.onnx"), b"weights").unwrap();
        assert!(loader.load(&Species::new("terns").unwrap()).is_ok());
    }

    #[test]
    fn detector_is_deterministic_and_thresholded() {
        let model = StubModel {
            species: Species::new("intruders").unwrap(),
            labels: vec!["person".to_string(), "vehicle".to_string()],
        };
        let thresholds = Thresholds {
            confidence: 0.5,
            overlap: 0.5,
        };
        let mut detector = StubDetector::new();
        let mut seen_any = false;
        for seed in 0..=255u8 {
            let f = frame(seed);
            let first = detector.infer(&model, &f, &thresholds).unwrap();
            let second = detector.infer(&model, &f, &thresholds).unwrap();
            assert_eq!(first, second);
            for d in &first {
                assert!(d.confidence >= 0.5 && d.confidence <= 1.0);
                assert!(model.labels.contains(&d.class_label));
            }
            seen_any |= !first.is_empty();
        }
        assert!(seen_any, "expected at least one detection across 256 frames");
    }
}
