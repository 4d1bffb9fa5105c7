#![cfg(feature = "backend-tract")]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{Detector, LoadError, ModelAsset, ModelLoader, Thresholds};
use crate::detect::nms::filter_detections;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;
use crate::mode::Species;

/// YOLO-style ONNX model prepared for inference.
pub struct TractModel {
    pub species: Species,
    pub labels: Vec<String>,
    plan: TypedRunnableModel<TypedModel>,
    input_size: u32,
}

/// Loads `<models_dir>/<species>.onnx` with a square `input_size` input.
pub struct TractLoader {
    models_dir: PathBuf,
    input_size: u32,
}

impl TractLoader {
    pub fn new(models_dir: impl Into<PathBuf>, input_size: u32) -> Self {
        Self {
            models_dir: models_dir.into(),
            input_size,
        }
    }

    fn build_plan(&self, asset: &ModelAsset) -> Result<TypedRunnableModel<TypedModel>> {
        let size = self.input_size as usize;
        tract_onnx::onnx()
            .model_for_path(&asset.model_path)
            .with_context(|| {
                format!(
                    "failed to load ONNX model from {}",
                    asset.model_path.display()
                )
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")
    }
}

impl ModelLoader for TractLoader {
    type Model = TractModel;

    fn name(&self) -> &'static str {
        "tract"
    }

    fn load(&mut self, species: &Species) -> Result<TractModel, LoadError> {
        let asset = ModelAsset::locate(&self.models_dir, species)?;
        let plan = self.build_plan(&asset).map_err(|err| LoadError::Failed {
            species: species.clone(),
            reason: format!("{:#}", err),
        })?;
        Ok(TractModel {
            species: species.clone(),
            labels: asset.labels,
            plan,
            input_size: self.input_size,
        })
    }
}

#[derive(Default)]
pub struct TractDetector;

impl TractDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Detector for TractDetector {
    type Model = TractModel;

    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(
        &mut self,
        model: &TractModel,
        frame: &Frame,
        thresholds: &Thresholds,
    ) -> Result<Vec<Detection>> {
        let input = build_input(frame, model.input_size)?;
        let outputs = model
            .plan
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let candidates = decode_output(output, &model.labels, model.input_size, thresholds)?;
        Ok(filter_detections(
            candidates,
            thresholds.confidence,
            thresholds.overlap,
        ))
    }
}

fn build_input(frame: &Frame, size: u32) -> Result<Tensor> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
    let resized = image::imageops::resize(&image, size, size, FilterType::Triangle);
    let pixels = resized.as_raw();

    let side = size as usize;
    let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
        pixels[(y * side + x) * 3 + channel] as f32 / 255.0
    });
    Ok(input.into_tensor())
}

/// Decode a `[1, 4 + classes, anchors]` (or transposed) YOLO head.
///
/// Box coordinates are centre/size in input pixels; the result is normalized.
fn decode_output(
    output: &Tensor,
    labels: &[String],
    input_size: u32,
    thresholds: &Thresholds,
) -> Result<Vec<Detection>> {
    let view = output
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?
        .into_dimensionality::<tract_ndarray::Ix3>()
        .context("model output is not rank 3")?;
    let (_, d1, d2) = view.dim();
    let attrs_first = d1 <= d2;
    let (attrs, anchors) = if attrs_first { (d1, d2) } else { (d2, d1) };
    if attrs < 5 {
        return Err(anyhow!("model output has {} attributes, expected >= 5", attrs));
    }
    let at = |attr: usize, anchor: usize| {
        if attrs_first {
            view[[0, attr, anchor]]
        } else {
            view[[0, anchor, attr]]
        }
    };

    let size = input_size as f32;
    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let (class_idx, score) = (4..attrs)
            .map(|attr| (attr - 4, at(attr, anchor)))
            .fold((0, f32::NEG_INFINITY), |best, current| {
                if current.1 > best.1 {
                    current
                } else {
                    best
                }
            });
        if !score.is_finite() || score < thresholds.confidence {
            continue;
        }
        let (cx, cy, w, h) = (
            at(0, anchor),
            at(1, anchor),
            at(2, anchor),
            at(3, anchor),
        );
        let class_label = labels
            .get(class_idx)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_idx));
        detections.push(Detection {
            class_label,
            confidence: score.clamp(0.0, 1.0),
            bbox: BoundingBox {
                x: (cx - w / 2.0) / size,
                y: (cy - h / 2.0) / size,
                w: w / size,
                h: h / size,
            },
        });
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_attribute_major_output() -> Result<()> {
        // Two anchors, two classes: anchor 0 is a confident class-1 box.
        let data: Vec<f32> = vec![
            320.0, 10.0, // cx
            320.0, 10.0, // cy
            64.0, 4.0, // w
            64.0, 4.0, // h
            0.1, 0.2, // class 0
            0.9, 0.1, // class 1
        ];
        let tensor = tract_ndarray::Array3::from_shape_vec((1, 6, 2), data)?.into_tensor();
        let labels = vec!["person".to_string(), "vehicle".to_string()];
        let detections = decode_output(&tensor, &labels, 640, &Thresholds::default())?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_label, "vehicle");
        assert!((detections[0].bbox.x - 0.45).abs() < 1e-6);
        assert!((detections[0].bbox.w - 0.1).abs() < 1e-6);
        Ok(())
    }
}
