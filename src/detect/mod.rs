//! Species detection: model loading, inference and result aggregation.

mod backend;
pub mod backends;
mod nms;
mod result;

pub use backend::{
    Detector, LoadError, ModelAsset, ModelLoader, Thresholds, LABELS_EXTENSION, MODEL_EXTENSION,
};
pub use backends::{StubDetector, StubLoader, StubModel};
#[cfg(feature = "backend-tract")]
pub use backends::{TractDetector, TractLoader, TractModel};
pub use nms::filter_detections;
pub use result::{BoundingBox, ClassSummary, Detection, DetectionSummary};
