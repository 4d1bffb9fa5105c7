//! sentineld - wildlife sentinel edge daemon
//!
//! This daemon:
//! 1. Polls the relay for the species operators want watched
//! 2. Keeps that species' detection model resident and the camera running
//! 3. Runs inference on each frame
//! 4. Publishes evidence and notifies subscribers, at most once per cooldown
//! 5. Records detections as metrics
//!
//! Configuration problems and an unusable camera are fatal at startup. Anything
//! that fails after the loop starts is logged and retried.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wildlife_sentinel::{
    open_source, Alerter, Collaborators, DetectionLoop, Detector, FrameSource, HttpModeSource,
    LoopStats, MetricsSink, ModeSource, ModelLoader, RelayAlerter, SentinelConfig, StubDetector,
    StubLoader, SystemClock,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Deterministic stand-in detector, for bench runs.
    Stub,
    /// ONNX models via tract (feature: backend-tract).
    Tract,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file.
    #[arg(long, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,
    /// Inference backend.
    #[arg(long, value_enum, default_value_t = Backend::Stub)]
    backend: Backend,
    /// Stop after this many loop iterations.
    #[arg(long)]
    max_iterations: Option<u64>,
}

/// Collaborators that do not depend on the inference backend.
struct Services {
    mode_source: Box<dyn ModeSource>,
    camera: Box<dyn FrameSource>,
    alerter: Box<dyn Alerter>,
    metrics: Box<dyn MetricsSink>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = SentinelConfig::load_from(args.config.as_deref())?;

    let camera = open_source(&cfg.camera)
        .with_context(|| format!("camera {} is not usable", cfg.camera.device))?;
    let mode_source = HttpModeSource::new(
        &cfg.relay.url,
        cfg.relay.timeout,
        cfg.relay.stop_words.clone(),
    )?;
    let alerter = RelayAlerter::new(
        &cfg.relay.url,
        cfg.relay.alert_key.clone(),
        cfg.relay.timeout,
        cfg.evidence_publisher(),
        cfg.alerts.jpeg_quality,
    )?;
    let metrics = cfg.metrics_sink()?;

    log::info!("sentineld running. relay {}", cfg.relay.url);
    log::info!(
        "mode endpoint {}, alert endpoint {}",
        mode_source.endpoint(),
        alerter.endpoint()
    );
    log::info!(
        "cooldown {:?}, thresholds conf={:.2} iou={:.2}, models in {}",
        cfg.alerts.cooldown,
        cfg.models.thresholds.confidence,
        cfg.models.thresholds.overlap,
        cfg.models.dir.display()
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .context("install Ctrl-C handler")?;
    }

    let services = Services {
        mode_source: Box::new(mode_source),
        camera,
        alerter: Box::new(alerter),
        metrics,
    };

    let stats = match args.backend {
        Backend::Stub => {
            let loader = if cfg.models.dir.is_dir() {
                StubLoader::with_models_dir(&cfg.models.dir)
            } else {
                log::warn!(
                    "models dir {} not found; stub backend accepts any species",
                    cfg.models.dir.display()
                );
                StubLoader::new()
            };
            run_loop(&cfg, services, loader, StubDetector::new(), &stop, args.max_iterations)
        }
        Backend::Tract => run_tract(&cfg, services, &stop, args.max_iterations)?,
    };

    log::info!(
        "sentineld exiting: frames={} alerts={} alert_failures={} load_failures={}",
        stats.frames,
        stats.alerts_sent,
        stats.alert_failures,
        stats.load_failures
    );
    Ok(())
}

#[cfg(feature = "backend-tract")]
fn run_tract(
    cfg: &SentinelConfig,
    services: Services,
    stop: &AtomicBool,
    max_iterations: Option<u64>,
) -> Result<LoopStats> {
    use wildlife_sentinel::{TractDetector, TractLoader};

    let loader = TractLoader::new(&cfg.models.dir, cfg.models.input_size);
    Ok(run_loop(
        cfg,
        services,
        loader,
        TractDetector::new(),
        stop,
        max_iterations,
    ))
}

#[cfg(not(feature = "backend-tract"))]
fn run_tract(
    _cfg: &SentinelConfig,
    _services: Services,
    _stop: &AtomicBool,
    _max_iterations: Option<u64>,
) -> Result<LoopStats> {
    anyhow::bail!("--backend tract requires the backend-tract feature")
}

fn run_loop<L, D>(
    cfg: &SentinelConfig,
    services: Services,
    loader: L,
    detector: D,
    stop: &AtomicBool,
    max_iterations: Option<u64>,
) -> LoopStats
where
    L: ModelLoader,
    D: Detector<Model = L::Model>,
{
    let collaborators = Collaborators {
        mode_source: services.mode_source,
        camera: services.camera,
        loader,
        detector,
        alerter: services.alerter,
        metrics: services.metrics,
        clock: Box::new(SystemClock),
    };
    let mut detection_loop = DetectionLoop::new(
        cfg.detection_loop.clone(),
        collaborators,
        cfg.cooldown_gate(),
        cfg.alert_policy(),
    );
    detection_loop.run(stop, max_iterations)
}
