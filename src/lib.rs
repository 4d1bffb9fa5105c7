//! Wildlife Sentinel
//!
//! Edge species detection for field monitoring stations. An operator picks the
//! species to watch on a remote relay; the device polls for that choice, keeps
//! the matching detection model resident, runs it over the camera feed and
//! notifies every subscriber through the relay when the species shows up.
//!
//! # Guarantees
//!
//! 1. **Single resident model**: switching species drops the previous model
//!    before the next one is loaded.
//! 2. **Degraded continuity**: a failed mode poll never changes what is being
//!    watched.
//! 3. **Cooldown per species**: at most one alert batch per species per cooldown
//!    window, whether or not dispatch succeeded.
//! 4. **No collaborator is fatal**: camera, network, model, alert and metrics
//!    failures are logged and counted; the loop keeps running.
//!
//! # Module Structure
//!
//! - `mode`: operating mode and the relay mode source
//! - `ingest`: camera frame sources (synthetic, V4L2)
//! - `detect`: model loading, inference backends, NMS and aggregation
//! - `model_cache`: single-slot model residency
//! - `cooldown`: per-species alert gate
//! - `alert`: alert policy, relay alerter and evidence publishers
//! - `metrics`: detection time series (InfluxDB, log)
//! - `detection_loop`: the state machine tying it together
//! - `config`: daemon configuration (JSON file + environment)

pub mod alert;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod detect;
pub mod detection_loop;
pub mod frame;
pub mod ingest;
pub mod metrics;
pub mod mode;
pub mod model_cache;

pub use alert::{
    Alert, AlertError, AlertKind, AlertPolicy, AlertReceipt, Alerter, EvidencePublisher,
    GithubPublisher, InlinePublisher, NoPublisher, PublishError, RelayAlerter,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SentinelConfig;
pub use cooldown::{CooldownGate, DEFAULT_COOLDOWN};
pub use detect::{
    BoundingBox, ClassSummary, Detection, DetectionSummary, Detector, LoadError, ModelLoader,
    StubDetector, StubLoader, StubModel, Thresholds,
};
#[cfg(feature = "backend-tract")]
pub use detect::{TractDetector, TractLoader, TractModel};
pub use detection_loop::{
    Collaborators, DetectionLoop, LoopSettings, LoopState, LoopStats, LoopStatus,
};
pub use frame::Frame;
pub use ingest::{
    open_source, CameraConfig, CameraError, CaptureError, FrameSource, SourceStats,
    SyntheticSource,
};
pub use metrics::{DetectionRecord, InfluxConfig, InfluxSink, LogSink, MetricsSink};
pub use mode::{HttpModeSource, ModeSource, OperatingMode, Species};
pub use model_cache::ModelCache;
