//! Scriptable collaborators for driving the detection loop in tests.
//!
//! Every fake shares its state through an `Arc<Mutex<..>>` probe so a test can
//! keep a handle after the loop takes ownership of the fake.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use wildlife_sentinel::{
    Alert, AlertError, AlertPolicy, AlertReceipt, Alerter, BoundingBox, CameraError,
    CaptureError, Collaborators, CooldownGate, Detection, DetectionLoop, DetectionRecord,
    Detector, Frame, FrameSource, LoadError, LoopSettings, ManualClock, MetricsSink, ModeSource,
    ModelLoader, OperatingMode, SourceStats, Species, Thresholds,
};

pub type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(shared: &Shared<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn sp(id: &str) -> Species {
    Species::new(id).expect("valid species")
}

pub fn watch(id: &str) -> OperatingMode {
    OperatingMode::Watch(sp(id))
}

pub fn det(label: &str, confidence: f32) -> Detection {
    Detection {
        class_label: label.to_string(),
        confidence,
        bbox: BoundingBox {
            x: 0.25,
            y: 0.25,
            w: 0.5,
            h: 0.5,
        },
    }
}

/// Returns scripted modes in order, then repeats the last one.
pub struct ScriptedModeSource {
    probe: Shared<ModeProbe>,
}

#[derive(Default)]
pub struct ModeProbe {
    pub script: Vec<OperatingMode>,
    pub polls: usize,
}

impl ScriptedModeSource {
    pub fn new(script: Vec<OperatingMode>) -> (Self, Shared<ModeProbe>) {
        let probe = Arc::new(Mutex::new(ModeProbe {
            script,
            polls: 0,
        }));
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl ModeSource for ScriptedModeSource {
    fn poll(&mut self) -> OperatingMode {
        let mut probe = lock(&self.probe);
        let index = probe.polls.min(probe.script.len().saturating_sub(1));
        probe.polls += 1;
        probe
            .script
            .get(index)
            .cloned()
            .unwrap_or(OperatingMode::Unknown)
    }
}

#[derive(Default)]
pub struct CameraProbe {
    pub running: bool,
    pub starts: usize,
    pub stops: usize,
    pub fail_start: bool,
    pub fail_capture: bool,
    pub frames: u64,
    pub capture_failures: u64,
}

pub struct FakeCamera {
    probe: Shared<CameraProbe>,
    width: u32,
    height: u32,
}

impl FakeCamera {
    pub fn new() -> (Self, Shared<CameraProbe>) {
        let probe = Arc::new(Mutex::new(CameraProbe::default()));
        (
            Self {
                probe: Arc::clone(&probe),
                width: 16,
                height: 12,
            },
            probe,
        )
    }
}

impl FrameSource for FakeCamera {
    fn describe(&self) -> String {
        "fake://camera".to_string()
    }

    fn start(&mut self) -> Result<(), CameraError> {
        let mut probe = lock(&self.probe);
        if probe.fail_start {
            return Err(CameraError {
                device: "fake://camera".to_string(),
                reason: "device busy".to_string(),
            });
        }
        if !probe.running {
            probe.running = true;
            probe.starts += 1;
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut probe = lock(&self.probe);
        if !probe.running {
            return Err(CaptureError::NotStarted);
        }
        if probe.fail_capture {
            probe.capture_failures += 1;
            return Err(CaptureError::Timeout(Duration::from_secs(2)));
        }
        probe.frames += 1;
        let pixels = vec![40u8; (self.width * self.height * 3) as usize];
        Frame::from_rgb(pixels, self.width, self.height, probe.frames)
            .map_err(|e| CaptureError::Read(e.to_string()))
    }

    fn stop(&mut self) {
        let mut probe = lock(&self.probe);
        if probe.running {
            probe.running = false;
            probe.stops += 1;
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.probe).running
    }

    fn stats(&self) -> SourceStats {
        let probe = lock(&self.probe);
        SourceStats {
            frames_captured: probe.frames,
            capture_failures: probe.capture_failures,
            starts: probe.starts as u64,
        }
    }
}

#[derive(Default)]
pub struct LoaderProbe {
    pub loads: Vec<Species>,
    pub failed_loads: Vec<Species>,
    pub releases: usize,
    pub live: usize,
    pub max_live: usize,
    pub failing: HashSet<Species>,
}

/// Model handle whose drop is observable.
pub struct FakeModel {
    pub species: Species,
    probe: Shared<LoaderProbe>,
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        let mut probe = lock(&self.probe);
        probe.releases += 1;
        probe.live -= 1;
    }
}

pub struct CountingLoader {
    probe: Shared<LoaderProbe>,
}

impl CountingLoader {
    pub fn new() -> (Self, Shared<LoaderProbe>) {
        let probe = Arc::new(Mutex::new(LoaderProbe::default()));
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl ModelLoader for CountingLoader {
    type Model = FakeModel;

    fn name(&self) -> &'static str {
        "counting"
    }

    fn load(&mut self, species: &Species) -> Result<FakeModel, LoadError> {
        let mut probe = lock(&self.probe);
        if probe.failing.contains(species) {
            probe.failed_loads.push(species.clone());
            return Err(LoadError::Failed {
                species: species.clone(),
                reason: "weights unreadable".to_string(),
            });
        }
        probe.loads.push(species.clone());
        probe.live += 1;
        probe.max_live = probe.max_live.max(probe.live);
        Ok(FakeModel {
            species: species.clone(),
            probe: Arc::clone(&self.probe),
        })
    }
}

#[derive(Default)]
pub struct DetectorProbe {
    pub detections: Vec<Detection>,
    pub fail: bool,
    pub calls: usize,
    pub models_seen: Vec<Species>,
}

/// Returns the scripted detections on every call.
pub struct ScriptedDetector {
    probe: Shared<DetectorProbe>,
}

impl ScriptedDetector {
    pub fn new() -> (Self, Shared<DetectorProbe>) {
        let probe = Arc::new(Mutex::new(DetectorProbe::default()));
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl Detector for ScriptedDetector {
    type Model = FakeModel;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(
        &mut self,
        model: &FakeModel,
        _frame: &Frame,
        _thresholds: &Thresholds,
    ) -> Result<Vec<Detection>> {
        let mut probe = lock(&self.probe);
        probe.calls += 1;
        probe.models_seen.push(model.species.clone());
        if probe.fail {
            return Err(anyhow!("accelerator fault"));
        }
        Ok(probe.detections.clone())
    }
}

#[derive(Default)]
pub struct AlerterProbe {
    /// Clock offset of every dispatch attempt.
    pub attempts: Vec<(Duration, Alert)>,
    pub delivered: Vec<Alert>,
    /// Size of every published evidence frame.
    pub evidence_sizes: Vec<(u32, u32)>,
    /// Image URL each attempt carried.
    pub images: Vec<Option<String>>,
    /// Number of upcoming attempts that fail.
    pub fail_next: usize,
    /// Simulated relay latency; the shared clock advances by this per attempt.
    pub latency: Duration,
}

pub struct RecordingAlerter {
    probe: Shared<AlerterProbe>,
    clock: ManualClock,
}

impl RecordingAlerter {
    pub fn new(clock: ManualClock) -> (Self, Shared<AlerterProbe>) {
        let probe = Arc::new(Mutex::new(AlerterProbe::default()));
        (
            Self {
                probe: Arc::clone(&probe),
                clock,
            },
            probe,
        )
    }
}

impl Alerter for RecordingAlerter {
    fn publish_evidence(&mut self, evidence: &Frame) -> Option<String> {
        let mut probe = lock(&self.probe);
        probe.evidence_sizes.push((evidence.width, evidence.height));
        Some(format!("evidence://{}", probe.evidence_sizes.len()))
    }

    fn notify(
        &mut self,
        alert: &Alert,
        image_url: Option<&str>,
    ) -> Result<AlertReceipt, AlertError> {
        let mut probe = lock(&self.probe);
        probe.attempts.push((self.clock.elapsed(), alert.clone()));
        probe.images.push(image_url.map(str::to_string));
        self.clock.advance(probe.latency);
        if probe.fail_next > 0 {
            probe.fail_next -= 1;
            return Err(AlertError::Transport("relay unreachable".to_string()));
        }
        probe.delivered.push(alert.clone());
        Ok(AlertReceipt {
            image_url: image_url.map(str::to_string),
        })
    }
}

#[derive(Default)]
pub struct MetricsProbe {
    pub records: Vec<DetectionRecord>,
    pub fail: bool,
    pub closed: usize,
}

pub struct RecordingMetrics {
    probe: Shared<MetricsProbe>,
}

impl RecordingMetrics {
    pub fn new() -> (Self, Shared<MetricsProbe>) {
        let probe = Arc::new(Mutex::new(MetricsProbe::default()));
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&mut self, record: &DetectionRecord) -> Result<()> {
        let mut probe = lock(&self.probe);
        if probe.fail {
            return Err(anyhow!("influxdb unreachable"));
        }
        probe.records.push(record.clone());
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.probe).closed += 1;
    }
}

/// Handles to every fake wired into a loop.
pub struct Probes {
    pub mode: Shared<ModeProbe>,
    pub camera: Shared<CameraProbe>,
    pub loader: Shared<LoaderProbe>,
    pub detector: Shared<DetectorProbe>,
    pub alerter: Shared<AlerterProbe>,
    pub metrics: Shared<MetricsProbe>,
    pub clock: ManualClock,
}

impl Probes {
    pub fn camera(&self) -> MutexGuard<'_, CameraProbe> {
        lock(&self.camera)
    }

    pub fn loader(&self) -> MutexGuard<'_, LoaderProbe> {
        lock(&self.loader)
    }

    pub fn detector(&self) -> MutexGuard<'_, DetectorProbe> {
        lock(&self.detector)
    }

    pub fn alerter(&self) -> MutexGuard<'_, AlerterProbe> {
        lock(&self.alerter)
    }

    pub fn metrics(&self) -> MutexGuard<'_, MetricsProbe> {
        lock(&self.metrics)
    }

    pub fn mode(&self) -> MutexGuard<'_, ModeProbe> {
        lock(&self.mode)
    }
}

pub type TestLoop = DetectionLoop<CountingLoader, ScriptedDetector>;

pub fn settings(poll_every: u64) -> LoopSettings {
    LoopSettings {
        poll_every,
        idle_interval: Duration::from_millis(100),
        frame_interval: Duration::ZERO,
        capture_failures_before_backoff: 3,
        capture_backoff: Duration::from_secs(1),
        max_frame_width: 640,
        health_log_interval: Duration::from_secs(30),
        degraded_release_after_polls: None,
        thresholds: Thresholds::default(),
    }
}

pub fn build(script: Vec<OperatingMode>, settings: LoopSettings) -> (TestLoop, Probes) {
    build_with(script, settings, CooldownGate::default(), AlertPolicy::default())
}

pub fn build_with(
    script: Vec<OperatingMode>,
    settings: LoopSettings,
    gate: CooldownGate,
    policy: AlertPolicy,
) -> (TestLoop, Probes) {
    let clock = ManualClock::new();
    let (mode_source, mode) = ScriptedModeSource::new(script);
    let (camera, camera_probe) = FakeCamera::new();
    let (loader, loader_probe) = CountingLoader::new();
    let (detector, detector_probe) = ScriptedDetector::new();
    let (alerter, alerter_probe) = RecordingAlerter::new(clock.clone());
    let (metrics, metrics_probe) = RecordingMetrics::new();

    let collaborators = Collaborators {
        mode_source: Box::new(mode_source),
        camera: Box::new(camera),
        loader,
        detector,
        alerter: Box::new(alerter),
        metrics: Box::new(metrics),
        clock: Box::new(clock.clone()),
    };
    let detection_loop = DetectionLoop::new(settings, collaborators, gate, policy);
    let probes = Probes {
        mode,
        camera: camera_probe,
        loader: loader_probe,
        detector: detector_probe,
        alerter: alerter_probe,
        metrics: metrics_probe,
        clock,
    };
    (detection_loop, probes)
}

pub fn step_n(detection_loop: &mut TestLoop, n: usize) {
    for _ in 0..n {
        detection_loop.step();
    }
}
