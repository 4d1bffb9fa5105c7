//! Edge detection loop.
//!
//! A single-threaded state machine. Every `poll_every` iterations it asks the
//! mode source what to watch and applies the answer before touching the camera or
//! detector for that iteration:
//!
//! - `Idle --Watch(s)--> Active(s)`: load the model, then start the camera.
//! - `Active(s) --Watch(s2)--> Active(s2)`: the camera stays running and only the
//!   model is swapped.
//! - `Active(s) --Stopped--> Idle`: stop the camera and unload the model.
//! - `Unknown` changes nothing; the loop is marked degraded until the next
//!   successful poll.
//!
//! Active iterations capture a frame, run inference and, when the active species
//! is out of cooldown, dispatch one alert per detection group. They are paced to
//! `frame_interval` through the clock. Collaborator failures are logged and
//! counted; `step` never fails.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::alert::{AlertPolicy, Alerter};
use crate::clock::Clock;
use crate::cooldown::CooldownGate;
use crate::detect::{Detection, DetectionSummary, Detector, LoadError, ModelLoader, Thresholds};
use crate::frame::Frame;
use crate::ingest::{CaptureError, FrameSource};
use crate::metrics::{DetectionRecord, MetricsSink};
use crate::mode::{ModeSource, OperatingMode, Species};
use crate::model_cache::ModelCache;

#[derive(Clone, Debug, PartialEq)]
pub struct LoopSettings {
    /// Poll the mode source when `iteration % poll_every == 0`.
    pub poll_every: u64,
    /// Sleep between idle iterations.
    pub idle_interval: Duration,
    /// Minimum duration of an active iteration; zero runs unpaced.
    pub frame_interval: Duration,
    pub capture_failures_before_backoff: u32,
    pub capture_backoff: Duration,
    /// Frames wider than this are downscaled before inference; 0 disables.
    pub max_frame_width: u32,
    pub health_log_interval: Duration,
    /// Idle an active loop after this many consecutive `Unknown` polls.
    pub degraded_release_after_polls: Option<u32>,
    pub thresholds: Thresholds,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_every: 30,
            idle_interval: Duration::from_millis(100),
            frame_interval: Duration::from_millis(100),
            capture_failures_before_backoff: 5,
            capture_backoff: Duration::from_secs(1),
            max_frame_width: 640,
            health_log_interval: Duration::from_secs(30),
            degraded_release_after_polls: None,
            thresholds: Thresholds::default(),
        }
    }
}

/// Everything the loop drives. The loop takes ownership.
pub struct Collaborators<L, D> {
    pub mode_source: Box<dyn ModeSource>,
    pub camera: Box<dyn FrameSource>,
    pub loader: L,
    pub detector: D,
    pub alerter: Box<dyn Alerter>,
    pub metrics: Box<dyn MetricsSink>,
    pub clock: Box<dyn Clock>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Active(Species),
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Idle => f.write_str("idle"),
            LoopState::Active(species) => write!(f, "active:{}", species),
        }
    }
}

/// Counters since start.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub polls: u64,
    pub unknown_polls: u64,
    pub mode_changes: u64,
    pub model_loads: u64,
    pub load_failures: u64,
    pub camera_failures: u64,
    pub frames: u64,
    pub capture_failures: u64,
    pub capture_backoffs: u64,
    pub inference_failures: u64,
    pub frames_with_detections: u64,
    pub alerts_sent: u64,
    pub alert_failures: u64,
    pub alerts_suppressed: u64,
    pub metrics_failures: u64,
}

/// Point-in-time view of the loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopStatus {
    pub state: LoopState,
    pub degraded: bool,
    pub loaded_species: Option<Species>,
    pub camera_running: bool,
    pub stats: LoopStats,
}

pub struct DetectionLoop<L, D>
where
    L: ModelLoader,
    D: Detector<Model = L::Model>,
{
    settings: LoopSettings,
    mode_source: Box<dyn ModeSource>,
    camera: Box<dyn FrameSource>,
    cache: ModelCache<L>,
    detector: D,
    alerter: Box<dyn Alerter>,
    metrics: Box<dyn MetricsSink>,
    clock: Box<dyn Clock>,
    gate: CooldownGate,
    policy: AlertPolicy,
    state: LoopState,
    degraded: bool,
    consecutive_unknown: u32,
    consecutive_capture_failures: u32,
    iteration: u64,
    stats: LoopStats,
    shut_down: bool,
}

impl<L, D> DetectionLoop<L, D>
where
    L: ModelLoader,
    D: Detector<Model = L::Model>,
{
    pub fn new(
        settings: LoopSettings,
        collaborators: Collaborators<L, D>,
        gate: CooldownGate,
        policy: AlertPolicy,
    ) -> Self {
        Self {
            settings,
            mode_source: collaborators.mode_source,
            camera: collaborators.camera,
            cache: ModelCache::new(collaborators.loader),
            detector: collaborators.detector,
            alerter: collaborators.alerter,
            metrics: collaborators.metrics,
            clock: collaborators.clock,
            gate,
            policy,
            state: LoopState::Idle,
            degraded: false,
            consecutive_unknown: 0,
            consecutive_capture_failures: 0,
            iteration: 0,
            stats: LoopStats::default(),
            shut_down: false,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            state: self.state.clone(),
            degraded: self.degraded,
            loaded_species: self.cache.loaded_species().cloned(),
            camera_running: self.camera.is_running(),
            stats: self.stats.clone(),
        }
    }

    /// Run one iteration. Does nothing after `shutdown`.
    pub fn step(&mut self) {
        if self.shut_down {
            return;
        }
        let started = self.clock.now();
        if self.iteration % self.settings.poll_every.max(1) == 0 {
            self.poll_mode();
        }
        self.iteration += 1;
        self.stats.iterations += 1;

        match self.state.clone() {
            LoopState::Idle => self.clock.sleep(self.settings.idle_interval),
            LoopState::Active(species) => {
                self.process_frame(&species);
                self.pace(started);
            }
        }
    }

    /// Sleep out whatever is left of `frame_interval` since `started`.
    fn pace(&self, started: Instant) {
        let spent = self.clock.now().saturating_duration_since(started);
        if let Some(rest) = self.settings.frame_interval.checked_sub(spent) {
            self.clock.sleep(rest);
        }
    }

    /// Step until `stop` is set (or `max_iterations` steps have run), then shut down.
    pub fn run(&mut self, stop: &AtomicBool, max_iterations: Option<u64>) -> LoopStats {
        log::info!(
            "detection loop running (poll every {} iterations, camera {})",
            self.settings.poll_every,
            self.camera.describe()
        );
        let mut last_health_log = self.clock.now();
        let mut steps = 0u64;
        while !stop.load(Ordering::SeqCst) {
            if max_iterations.is_some_and(|max| steps >= max) {
                log::info!("iteration limit {} reached", steps);
                break;
            }
            self.step();
            steps += 1;

            let now = self.clock.now();
            if now.saturating_duration_since(last_health_log) >= self.settings.health_log_interval
            {
                self.log_health();
                last_health_log = now;
            }
        }
        self.shutdown();
        self.stats.clone()
    }

    /// Stop the camera, unload the model and close metrics. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.camera.stop();
        self.cache.unload();
        self.metrics.close();
        self.state = LoopState::Idle;
        log::info!(
            "detection loop stopped after {} iterations ({} alerts sent)",
            self.stats.iterations,
            self.stats.alerts_sent
        );
    }

    fn log_health(&self) {
        let camera = self.camera.stats();
        log::info!(
            "health state={} degraded={} frames={} capture_failures={} alerts={} alert_failures={} suppressed={}",
            self.state,
            self.degraded,
            camera.frames_captured,
            self.stats.capture_failures,
            self.stats.alerts_sent,
            self.stats.alert_failures,
            self.stats.alerts_suppressed
        );
    }

    fn poll_mode(&mut self) {
        self.stats.polls += 1;
        match self.mode_source.poll() {
            OperatingMode::Unknown => self.on_unknown_mode(),
            OperatingMode::Stopped => {
                self.clear_degraded();
                self.apply_stop();
            }
            OperatingMode::Watch(species) => {
                self.clear_degraded();
                self.apply_watch(species);
            }
        }
    }

    fn clear_degraded(&mut self) {
        if self.degraded {
            log::info!(
                "mode source reachable again after {} failed polls",
                self.consecutive_unknown
            );
        }
        self.degraded = false;
        self.consecutive_unknown = 0;
    }

    fn on_unknown_mode(&mut self) {
        self.stats.unknown_polls += 1;
        self.consecutive_unknown += 1;
        if !self.degraded {
            log::warn!("mode unknown, keeping {}", self.state);
            self.degraded = true;
        }

        let Some(limit) = self.settings.degraded_release_after_polls else {
            return;
        };
        if self.consecutive_unknown >= limit {
            if let LoopState::Active(species) = &self.state {
                log::warn!(
                    "mode unknown for {} polls, idling '{}' to save power",
                    self.consecutive_unknown,
                    species
                );
                self.go_idle();
            }
        }
    }

    fn apply_stop(&mut self) {
        if let LoopState::Active(species) = &self.state {
            log::info!("watch for '{}' stopped by operator", species);
            self.go_idle();
        }
    }

    fn apply_watch(&mut self, species: Species) {
        match self.state.clone() {
            LoopState::Active(current) if current == species => {}
            LoopState::Active(current) => self.switch_species(current, species),
            LoopState::Idle => self.start_watch(species),
        }
    }

    fn start_watch(&mut self, species: Species) {
        if let Err(err) = self.load(&species) {
            log::warn!("{}; staying idle until the next poll", err);
            return;
        }
        if let Err(err) = self.camera.start() {
            self.stats.camera_failures += 1;
            log::warn!("{}; releasing model and staying idle", err);
            self.cache.unload();
            return;
        }
        log::info!("watching for '{}'", species);
        self.consecutive_capture_failures = 0;
        self.stats.mode_changes += 1;
        self.state = LoopState::Active(species);
    }

    fn switch_species(&mut self, current: Species, next: Species) {
        match self.load(&next) {
            Ok(()) => {
                log::info!("switched watch from '{}' to '{}'", current, next);
                self.stats.mode_changes += 1;
                self.state = LoopState::Active(next);
            }
            Err(err) => {
                log::warn!("{}; restoring '{}'", err, current);
                if let Err(err) = self.load(&current) {
                    log::warn!("{}; going idle", err);
                    self.go_idle();
                }
            }
        }
    }

    fn load(&mut self, species: &Species) -> Result<(), LoadError> {
        match self.cache.ensure_loaded(species) {
            Ok(_) => {
                self.stats.model_loads += 1;
                Ok(())
            }
            Err(err) => {
                self.stats.load_failures += 1;
                Err(err)
            }
        }
    }

    fn go_idle(&mut self) {
        self.camera.stop();
        self.cache.unload();
        self.consecutive_capture_failures = 0;
        self.stats.mode_changes += 1;
        self.state = LoopState::Idle;
    }

    fn process_frame(&mut self, species: &Species) {
        let frame = match self.camera.next_frame() {
            Ok(frame) => {
                self.consecutive_capture_failures = 0;
                frame
            }
            Err(err) => {
                self.on_capture_failure(err);
                return;
            }
        };
        self.stats.frames += 1;

        let frame = match frame.downscale_to_width(self.settings.max_frame_width) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("frame downscale failed: {:#}", err);
                return;
            }
        };

        let Some(model) = self.cache.current() else {
            log::warn!("no model resident while watching '{}'", species);
            return;
        };
        let detections = match self.detector.infer(model, &frame, &self.settings.thresholds) {
            Ok(detections) => detections,
            Err(err) => {
                self.stats.inference_failures += 1;
                log::warn!("{} inference failed: {:#}", self.detector.name(), err);
                return;
            }
        };
        if detections.is_empty() {
            return;
        }
        self.stats.frames_with_detections += 1;

        let now = self.clock.now();
        if !self.gate.is_eligible(species, now) {
            self.stats.alerts_suppressed += 1;
            log::debug!(
                "'{}' detected but cooling down for {:?}",
                species,
                self.gate.remaining(species, now)
            );
            return;
        }
        self.dispatch(species, &frame, &detections, now);
    }

    fn on_capture_failure(&mut self, err: CaptureError) {
        self.stats.capture_failures += 1;
        self.consecutive_capture_failures += 1;
        if self.consecutive_capture_failures >= self.settings.capture_failures_before_backoff {
            log::warn!(
                "{} consecutive capture failures (last: {}), backing off {:?}",
                self.consecutive_capture_failures,
                err,
                self.settings.capture_backoff
            );
            self.stats.capture_backoffs += 1;
            self.consecutive_capture_failures = 0;
            self.clock.sleep(self.settings.capture_backoff);
        } else {
            log::debug!("capture failed: {}", err);
        }
    }

    /// Alert every group of one frame. The cooldown window starts at `detected_at`,
    /// however long delivery takes and whether or not it succeeds.
    fn dispatch(
        &mut self,
        species: &Species,
        frame: &Frame,
        detections: &[Detection],
        detected_at: Instant,
    ) {
        let summary = DetectionSummary::from_detections(detections);
        let timestamp = self.clock.wall_now();
        let evidence = frame.annotated(detections);
        let image_url = self.alerter.publish_evidence(&evidence);

        for alert in self.policy.build_alerts(species, &summary) {
            match self.alerter.notify(&alert, image_url.as_deref()) {
                Ok(_) => self.stats.alerts_sent += 1,
                Err(err) => {
                    self.stats.alert_failures += 1;
                    log::warn!("alert for '{}' not delivered: {}", alert.species, err);
                }
            }

            let record = DetectionRecord {
                species: alert.species.clone(),
                count: alert.count,
                confidence: alert.confidence,
                timestamp,
            };
            if let Err(err) = self.metrics.record(&record) {
                self.stats.metrics_failures += 1;
                log::warn!("metrics record failed: {:#}", err);
            }
        }

        self.gate.record_alert(species, detected_at);
    }
}

impl<L, D> Drop for DetectionLoop<L, D>
where
    L: ModelLoader,
    D: Detector<Model = L::Model>,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
