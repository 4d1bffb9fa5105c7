use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::{
    AlertPolicy, EvidencePublisher, GithubPublisher, InlinePublisher, NoPublisher,
    DEFAULT_THREAT_SPECIES,
};
use crate::cooldown::{CooldownGate, DEFAULT_COOLDOWN};
use crate::detect::Thresholds;
use crate::detection_loop::LoopSettings;
use crate::ingest::CameraConfig;
use crate::metrics::{InfluxConfig, InfluxSink, LogSink, MetricsSink};
use crate::mode::{Species, DEFAULT_STOP_WORDS};

const DEFAULT_RELAY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MODELS_DIR: &str = "models";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_GITHUB_BRANCH: &str = "main";
const DEFAULT_GITHUB_FOLDER: &str = "capturas";
const DEFAULT_LOCATION: &str = "unknown";
const DEFAULT_DEVICE: &str = "sentinel";

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    relay: Option<RelayConfigFile>,
    camera: Option<CameraConfigFile>,
    models: Option<ModelsConfigFile>,
    #[serde(rename = "loop")]
    detection_loop: Option<LoopConfigFile>,
    alerts: Option<AlertsConfigFile>,
    evidence: Option<EvidenceConfigFile>,
    metrics: Option<MetricsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    url: Option<String>,
    alert_key: Option<String>,
    timeout_ms: Option<u64>,
    stop_words: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    capture_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    dir: Option<PathBuf>,
    confidence: Option<f32>,
    overlap: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct LoopConfigFile {
    poll_every: Option<u64>,
    idle_interval_ms: Option<u64>,
    capture_failures_before_backoff: Option<u32>,
    capture_backoff_ms: Option<u64>,
    max_frame_width: Option<u32>,
    health_log_secs: Option<u64>,
    degraded_release_after_polls: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    cooldown_secs: Option<u64>,
    cooldown_overrides: Option<HashMap<String, u64>>,
    threat_species: Option<Vec<String>>,
    collapsed_labels: Option<HashMap<String, String>>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct EvidenceConfigFile {
    publisher: Option<String>,
    github: Option<GithubConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct GithubConfigFile {
    token: Option<String>,
    owner: Option<String>,
    repo: Option<String>,
    branch: Option<String>,
    folder: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MetricsConfigFile {
    location: Option<String>,
    device: Option<String>,
    influxdb: Option<InfluxConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct InfluxConfigFile {
    url: Option<String>,
    token: Option<String>,
    org: Option<String>,
    bucket: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub relay: RelaySettings,
    pub camera: CameraConfig,
    pub models: ModelSettings,
    pub detection_loop: LoopSettings,
    pub alerts: AlertSettings,
    pub evidence: EvidenceSettings,
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Required; there is no sensible default relay.
    pub url: String,
    pub alert_key: Option<String>,
    pub timeout: Duration,
    pub stop_words: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub dir: PathBuf,
    pub thresholds: Thresholds,
    /// Square input edge for ONNX models.
    pub input_size: u32,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub cooldown: Duration,
    pub cooldown_overrides: HashMap<Species, Duration>,
    pub threat_species: Vec<Species>,
    pub collapsed_labels: HashMap<Species, String>,
    pub jpeg_quality: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvidenceMode {
    None,
    Inline,
    Github,
}

impl EvidenceMode {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "none" => Ok(EvidenceMode::None),
            "inline" => Ok(EvidenceMode::Inline),
            "github" => Ok(EvidenceMode::Github),
            other => Err(anyhow!(
                "unknown evidence publisher '{}' (expected none, inline or github)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvidenceSettings {
    pub mode: EvidenceMode,
    pub github: GithubSettings,
}

#[derive(Debug, Clone)]
pub struct GithubSettings {
    pub token: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub branch: String,
    pub folder: String,
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub location: String,
    pub device: String,
    pub influx_url: Option<String>,
    pub influx_token: Option<String>,
    pub influx_org: Option<String>,
    pub influx_bucket: Option<String>,
}

impl SentinelConfig {
    /// Read the file named by `SENTINEL_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file taking the place of `SENTINEL_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SentinelConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let relay_file = file.relay.unwrap_or_default();
        let relay = RelaySettings {
            url: relay_file.url.unwrap_or_default(),
            alert_key: relay_file.alert_key.filter(|key| !key.trim().is_empty()),
            timeout: Duration::from_millis(
                relay_file.timeout_ms.unwrap_or(DEFAULT_RELAY_TIMEOUT_MS),
            ),
            stop_words: relay_file
                .stop_words
                .unwrap_or_else(|| DEFAULT_STOP_WORDS.iter().map(|w| w.to_string()).collect()),
        };

        let camera_defaults = CameraConfig::default();
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraConfig {
            device: camera_file.device.unwrap_or(camera_defaults.device),
            width: camera_file.width.unwrap_or(camera_defaults.width),
            height: camera_file.height.unwrap_or(camera_defaults.height),
            target_fps: camera_file.target_fps.unwrap_or(camera_defaults.target_fps),
            capture_timeout: camera_file
                .capture_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(camera_defaults.capture_timeout),
        };

        let threshold_defaults = Thresholds::default();
        let models_file = file.models.unwrap_or_default();
        let models = ModelSettings {
            dir: models_file
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODELS_DIR)),
            thresholds: Thresholds {
                confidence: models_file
                    .confidence
                    .unwrap_or(threshold_defaults.confidence),
                overlap: models_file.overlap.unwrap_or(threshold_defaults.overlap),
            },
            input_size: models_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
        };

        let loop_defaults = LoopSettings::default();
        let loop_file = file.detection_loop.unwrap_or_default();
        let detection_loop = LoopSettings {
            poll_every: loop_file.poll_every.unwrap_or(loop_defaults.poll_every),
            idle_interval: loop_file
                .idle_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(loop_defaults.idle_interval),
            frame_interval: frame_interval(camera.target_fps),
            capture_failures_before_backoff: loop_file
                .capture_failures_before_backoff
                .unwrap_or(loop_defaults.capture_failures_before_backoff),
            capture_backoff: loop_file
                .capture_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(loop_defaults.capture_backoff),
            max_frame_width: loop_file
                .max_frame_width
                .unwrap_or(loop_defaults.max_frame_width),
            health_log_interval: loop_file
                .health_log_secs
                .map(Duration::from_secs)
                .unwrap_or(loop_defaults.health_log_interval),
            degraded_release_after_polls: loop_file
                .degraded_release_after_polls
                .or(loop_defaults.degraded_release_after_polls),
            thresholds: models.thresholds,
        };

        let alerts_file = file.alerts.unwrap_or_default();
        let cooldown_overrides = alerts_file
            .cooldown_overrides
            .unwrap_or_default()
            .into_iter()
            .map(|(id, secs)| Ok((Species::new(&id)?, Duration::from_secs(secs))))
            .collect::<Result<HashMap<_, _>>>()
            .context("alerts.cooldown_overrides")?;
        let threat_species = match alerts_file.threat_species {
            Some(ids) => parse_species_list(&ids).context("alerts.threat_species")?,
            None => DEFAULT_THREAT_SPECIES
                .iter()
                .map(|id| Species::new(id))
                .collect::<Result<Vec<_>>>()?,
        };
        let collapsed_labels = alerts_file
            .collapsed_labels
            .unwrap_or_default()
            .into_iter()
            .map(|(id, label)| Ok((Species::new(&id)?, label)))
            .collect::<Result<HashMap<_, _>>>()
            .context("alerts.collapsed_labels")?;
        let alerts = AlertSettings {
            cooldown: alerts_file
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COOLDOWN),
            cooldown_overrides,
            threat_species,
            collapsed_labels,
            jpeg_quality: alerts_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let evidence_file = file.evidence.unwrap_or_default();
        let github_file = evidence_file.github.unwrap_or_default();
        let evidence = EvidenceSettings {
            mode: match evidence_file.publisher.as_deref() {
                Some(value) => EvidenceMode::parse(value)?,
                None => EvidenceMode::Inline,
            },
            github: GithubSettings {
                token: github_file.token,
                owner: github_file.owner,
                repo: github_file.repo,
                branch: github_file
                    .branch
                    .unwrap_or_else(|| DEFAULT_GITHUB_BRANCH.to_string()),
                folder: github_file
                    .folder
                    .unwrap_or_else(|| DEFAULT_GITHUB_FOLDER.to_string()),
            },
        };

        let metrics_file = file.metrics.unwrap_or_default();
        let influx_file = metrics_file.influxdb.unwrap_or_default();
        let metrics = MetricsSettings {
            location: metrics_file
                .location
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            device: metrics_file
                .device
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            influx_url: influx_file.url,
            influx_token: influx_file.token,
            influx_org: influx_file.org,
            influx_bucket: influx_file.bucket,
        };

        Ok(Self {
            relay,
            camera,
            models,
            detection_loop,
            alerts,
            evidence,
            metrics,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("SENTINEL_RELAY_URL") {
            self.relay.url = url;
        }
        if let Some(key) = non_empty_env("SENTINEL_ALERT_KEY") {
            self.relay.alert_key = Some(key);
        }
        if let Some(device) = non_empty_env("SENTINEL_CAMERA") {
            self.camera.device = device;
        }
        if let Some(dir) = non_empty_env("SENTINEL_MODELS_DIR") {
            self.models.dir = PathBuf::from(dir);
        }
        if let Some(cooldown) = non_empty_env("SENTINEL_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.parse().map_err(|_| {
                anyhow!("SENTINEL_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.alerts.cooldown = Duration::from_secs(seconds);
        }
        if let Some(poll_every) = non_empty_env("SENTINEL_POLL_EVERY") {
            self.detection_loop.poll_every = poll_every
                .parse()
                .map_err(|_| anyhow!("SENTINEL_POLL_EVERY must be an integer iteration count"))?;
        }
        if let Some(publisher) = non_empty_env("SENTINEL_EVIDENCE") {
            self.evidence.mode = EvidenceMode::parse(&publisher)?;
        }
        if let Some(token) = non_empty_env("GITHUB_TOKEN") {
            self.evidence.github.token = Some(token);
        }
        if let Some(url) = non_empty_env("INFLUXDB_URL") {
            self.metrics.influx_url = Some(url);
        }
        if let Some(token) = non_empty_env("INFLUXDB_TOKEN") {
            self.metrics.influx_token = Some(token);
        }
        if let Some(org) = non_empty_env("INFLUXDB_ORG") {
            self.metrics.influx_org = Some(org);
        }
        if let Some(bucket) = non_empty_env("INFLUXDB_BUCKET") {
            self.metrics.influx_bucket = Some(bucket);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.relay.url.trim().is_empty() {
            return Err(anyhow!(
                "relay url is required (set relay.url or SENTINEL_RELAY_URL)"
            ));
        }
        let relay_url = url::Url::parse(&self.relay.url)
            .map_err(|e| anyhow!("invalid relay url {}: {}", self.relay.url, e))?;
        if !matches!(relay_url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "relay url must be http or https, got {}",
                self.relay.url
            ));
        }
        self.relay.stop_words = self
            .relay
            .stop_words
            .iter()
            .map(|word| word.trim().to_lowercase())
            .filter(|word| !word.is_empty())
            .collect();

        for (name, value) in [
            ("models.confidence", self.models.thresholds.confidence),
            ("models.overlap", self.models.thresholds.overlap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within 0..=1, got {}", name, value));
            }
        }
        if self.models.input_size == 0 {
            return Err(anyhow!("models.input_size must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.detection_loop.poll_every == 0 {
            return Err(anyhow!("loop.poll_every must be greater than zero"));
        }
        if self.detection_loop.degraded_release_after_polls == Some(0) {
            return Err(anyhow!(
                "loop.degraded_release_after_polls must be greater than zero when set"
            ));
        }
        if !(1..=100).contains(&self.alerts.jpeg_quality) {
            return Err(anyhow!("alerts.jpeg_quality must be within 1..=100"));
        }

        if self.evidence.mode == EvidenceMode::Github {
            let github = &self.evidence.github;
            if github.token.is_none() || github.owner.is_none() || github.repo.is_none() {
                return Err(anyhow!(
                    "github evidence publisher needs evidence.github.owner, evidence.github.repo and GITHUB_TOKEN"
                ));
            }
        }

        if let Some(url) = &self.metrics.influx_url {
            url::Url::parse(url).map_err(|e| anyhow!("invalid influxdb url {}: {}", url, e))?;
            if self.metrics.influx_token.is_none()
                || self.metrics.influx_org.is_none()
                || self.metrics.influx_bucket.is_none()
            {
                return Err(anyhow!(
                    "influxdb metrics need INFLUXDB_TOKEN, INFLUXDB_ORG and INFLUXDB_BUCKET"
                ));
            }
        }

        self.detection_loop.thresholds = self.models.thresholds;
        Ok(())
    }

    pub fn cooldown_gate(&self) -> CooldownGate {
        self.alerts
            .cooldown_overrides
            .iter()
            .fold(CooldownGate::new(self.alerts.cooldown), |gate, (species, cooldown)| {
                gate.with_override(species.clone(), *cooldown)
            })
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy::new(
            self.alerts.threat_species.clone(),
            self.alerts.collapsed_labels.clone(),
        )
    }

    pub fn evidence_publisher(&self) -> Box<dyn EvidencePublisher> {
        let github = &self.evidence.github;
        match (self.evidence.mode, &github.token, &github.owner, &github.repo) {
            (EvidenceMode::Github, Some(token), Some(owner), Some(repo)) => {
                Box::new(GithubPublisher::new(
                    token.clone(),
                    owner.clone(),
                    repo.clone(),
                    github.branch.clone(),
                    github.folder.clone(),
                    self.relay.timeout,
                ))
            }
            (EvidenceMode::None, ..) => Box::new(NoPublisher),
            _ => Box::new(InlinePublisher),
        }
    }

    pub fn influx_config(&self) -> Option<InfluxConfig> {
        let metrics = &self.metrics;
        Some(InfluxConfig {
            url: metrics.influx_url.clone()?,
            token: metrics.influx_token.clone()?,
            org: metrics.influx_org.clone()?,
            bucket: metrics.influx_bucket.clone()?,
            location: metrics.location.clone(),
            device: metrics.device.clone(),
            timeout: self.relay.timeout,
        })
    }

    /// InfluxDB when configured, otherwise log-only.
    pub fn metrics_sink(&self) -> Result<Box<dyn MetricsSink>> {
        match self.influx_config() {
            Some(config) => Ok(Box::new(InfluxSink::new(config)?)),
            None => Ok(Box::new(LogSink::new())),
        }
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Active iterations are paced to the camera frame rate; 0 fps runs unpaced.
fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(1) / target_fps
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_species_list(ids: &[String]) -> Result<Vec<Species>> {
    ids.iter().map(|id| Species::new(id)).collect()
}
