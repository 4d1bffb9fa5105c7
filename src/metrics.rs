//! Detection metrics.
//!
//! Every dispatched alert group is also recorded as a time-series point. Sinks
//! report errors, but the detection loop only logs them.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const MEASUREMENT: &str = "wildlife_detection";

/// One recorded detection group.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    pub species: String,
    pub count: usize,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

pub trait MetricsSink: Send {
    fn record(&mut self, record: &DetectionRecord) -> Result<()>;

    /// Flush and release the sink. Safe to call more than once.
    fn close(&mut self);
}

/// Writes records to the log only; used when no database is configured.
#[derive(Debug, Default)]
pub struct LogSink {
    recorded: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSink for LogSink {
    fn record(&mut self, record: &DetectionRecord) -> Result<()> {
        self.recorded += 1;
        log::info!(
            "detection recorded: {} x{} ({:.2}) at {}",
            record.species,
            record.count,
            record.confidence,
            record.timestamp.to_rfc3339()
        );
        Ok(())
    }

    fn close(&mut self) {
        log::debug!("log metrics sink closed after {} records", self.recorded);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub location: String,
    pub device: String,
    pub timeout: Duration,
}

/// InfluxDB v2 line-protocol writer.
pub struct InfluxSink {
    agent: ureq::Agent,
    write_url: String,
    token: String,
    location: String,
    device: String,
    closed: bool,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig) -> Result<Self> {
        let mut write_url = url::Url::parse(&config.url)
            .with_context(|| format!("invalid influxdb url {}", config.url))?
            .join("/api/v2/write")
            .context("build influxdb write url")?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(config.timeout).build(),
            write_url: write_url.to_string(),
            token: config.token,
            location: config.location,
            device: config.device,
            closed: false,
        })
    }

    pub fn write_url(&self) -> &str {
        &self.write_url
    }

    pub fn line(&self, record: &DetectionRecord) -> String {
        line_protocol(record, &self.location, &self.device)
    }
}

impl MetricsSink for InfluxSink {
    fn record(&mut self, record: &DetectionRecord) -> Result<()> {
        if self.closed {
            return Err(anyhow!("influxdb sink is closed"));
        }
        let line = self.line(record);
        self.agent
            .post(&self.write_url)
            .set("Authorization", &format!("Token {}", self.token))
            .set("Content-Type", "text/plain; charset=utf-8")
            .send_string(&line)
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => anyhow!("influxdb answered status {}", code),
                ureq::Error::Transport(transport) => anyhow!("influxdb unreachable: {}", transport),
            })?;
        log::debug!("influxdb point written: {}", line);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            log::info!("influxdb sink closed");
        }
    }
}

/// `wildlife_detection,species=..,location=..,device=.. count=Ni,confidence=F,detected=1i <ns>`
pub fn line_protocol(record: &DetectionRecord, location: &str, device: &str) -> String {
    let timestamp = record
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| record.timestamp.timestamp_micros().saturating_mul(1_000));
    format!(
        "{},species={},location={},device={} count={}i,confidence={},detected=1i {}",
        MEASUREMENT,
        escape_tag(&record.species),
        escape_tag(location),
        escape_tag(device),
        record.count,
        record.confidence,
        timestamp
    )
}

fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
