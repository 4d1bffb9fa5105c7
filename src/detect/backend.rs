use anyhow::Result;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::mode::Species;

/// Extension of model weights inside the models directory.
pub const MODEL_EXTENSION: &str = "onnx";
/// Optional sidecar listing class labels, one per line, in model output order.
pub const LABELS_EXTENSION: &str = "labels";

/// Fixed per-deployment inference thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    /// Minimum detection confidence (0..=1).
    pub confidence: f32,
    /// IoU above which a weaker box of the same class is suppressed (0..=1).
    pub overlap: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.75,
            overlap: 0.5,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model asset for '{species}' not found at {}", path.display())]
    AssetMissing { species: Species, path: PathBuf },
    #[error("failed to load model for '{species}': {reason}")]
    Failed { species: Species, reason: String },
}

impl LoadError {
    pub fn species(&self) -> &Species {
        match self {
            LoadError::AssetMissing { species, .. } | LoadError::Failed { species, .. } => species,
        }
    }
}

/// Loads the detection model for a species.
///
/// Releasing a model is dropping it; loaders must not keep their own references
/// to returned models.
pub trait ModelLoader: Send {
    type Model: Send;

    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn load(&mut self, species: &Species) -> Result<Self::Model, LoadError>;
}

/// Runs a loaded model over a frame.
///
/// Implementations must be deterministic for equal inputs and must not retain
/// the frame beyond the call.
pub trait Detector: Send {
    type Model;

    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn infer(
        &mut self,
        model: &Self::Model,
        frame: &Frame,
        thresholds: &Thresholds,
    ) -> Result<Vec<Detection>>;
}

/// Files backing one species model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelAsset {
    pub species: Species,
    pub model_path: PathBuf,
    pub labels: Vec<String>,
}

impl ModelAsset {
    /// Resolve `<dir>/<species>.onnx` and its labels.
    ///
    /// A missing labels sidecar means a single-class model labelled with the
    /// species name.
    pub fn locate(dir: &Path, species: &Species) -> Result<Self, LoadError> {
        let model_path = dir.join(format!("{}.{}", species, MODEL_EXTENSION));
        if !model_path.is_file() {
            return Err(LoadError::AssetMissing {
                species: species.clone(),
                path: model_path,
            });
        }

        let labels_path = dir.join(format!("{}.{}", species, LABELS_EXTENSION));
        let labels = if labels_path.is_file() {
            let raw = std::fs::read_to_string(&labels_path).map_err(|e| LoadError::Failed {
                species: species.clone(),
                reason: format!("read {}: {}", labels_path.display(), e),
            })?;
            let labels: Vec<String> = raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            if labels.is_empty() {
                return Err(LoadError::Failed {
                    species: species.clone(),
                    reason: format!("{} lists no labels", labels_path.display()),
                });
            }
            labels
        } else {
            vec![species.to_string()]
        };

        Ok(Self {
            species: species.clone(),
            model_path,
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_asset_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let species = Species::new("intruders").unwrap();
        let err = ModelAsset::locate(dir.path(), &species).unwrap_err();
        assert!(matches!(err, LoadError::AssetMissing { .. }));
        assert_eq!(err.species(), &species);
    }

    #[test]
    fn labels_default_to_species_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("turtles.onnx"), b"weights").unwrap();
        let asset = ModelAsset::locate(dir.path(), &Species::new("turtles").unwrap()).unwrap();
        assert_eq!(asset.labels, vec!["turtles".to_string()]);
    }

    #[test]
    fn labels_sidecar_is_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("intruders.onnx"), b"weights").unwrap();
        std::fs::write(dir.path().join("intruders.labels"), "person\n\nvehicle\ndog\n").unwrap();
        let asset = ModelAsset::locate(dir.path(), &Species::new("intruders").unwrap()).unwrap();
        assert_eq!(asset.labels, vec!["person", "vehicle", "dog"]);
    }

    #[test]
    fn empty_labels_sidecar_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("terns.onnx"), b"weights").unwrap();
        std::fs::write(dir.path().join("terns.labels"), "\n\n").unwrap();
        let err = ModelAsset::locate(dir.path(), &Species::new("terns").unwrap()).unwrap_err();
        assert!(matches!(err, LoadError::Failed { .. }));
    }
}
