//! Remote operating mode.
//!
//! Operators pick a species on the relay; the edge device discovers the choice by
//! polling. A poll never fails from the caller's point of view: any transport,
//! status or parse problem yields `OperatingMode::Unknown`, and the detection loop
//! keeps whatever mode it last applied.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Stop words accepted when no explicit list is configured.
pub const DEFAULT_STOP_WORDS: &[&str] = &["stopped", "stop", "detener"];

/// Monitoring target selected by an operator.
///
/// Identifiers are trimmed and lowercased so that "Turtles " and "turtles" never
/// look like a mode change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Species(String);

impl Species {
    pub fn new(id: &str) -> Result<Self> {
        let normalized = id.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(anyhow!("species identifier must not be empty"));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a mode poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    Watch(Species),
    Stopped,
    /// The poll failed. Never applied; the loop retains its previous mode.
    Unknown,
}

impl OperatingMode {
    pub fn species(&self) -> Option<&Species> {
        match self {
            OperatingMode::Watch(species) => Some(species),
            _ => None,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Watch(species) => write!(f, "watch:{}", species),
            OperatingMode::Stopped => f.write_str("stopped"),
            OperatingMode::Unknown => f.write_str("unknown"),
        }
    }
}

/// Source of the operator's current selection.
///
/// Implementations must bound every call with a short timeout and must map all
/// failures to `OperatingMode::Unknown`.
pub trait ModeSource: Send {
    fn poll(&mut self) -> OperatingMode;
}

#[derive(Debug, Deserialize)]
struct ModeResponse {
    mode: Option<String>,
}

/// Interpret a raw mode value from the relay.
pub fn interpret_mode(raw: Option<&str>, stop_words: &[String]) -> OperatingMode {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return OperatingMode::Unknown;
    };
    if stop_words
        .iter()
        .any(|word| word.eq_ignore_ascii_case(raw))
    {
        return OperatingMode::Stopped;
    }
    match Species::new(raw) {
        Ok(species) => OperatingMode::Watch(species),
        Err(_) => OperatingMode::Unknown,
    }
}

/// Interpret a `/config` response body. Malformed bodies are `Unknown`, not `Stopped`.
pub fn mode_from_body(body: &str, stop_words: &[String]) -> OperatingMode {
    match serde_json::from_str::<ModeResponse>(body) {
        Ok(response) => interpret_mode(response.mode.as_deref(), stop_words),
        Err(err) => {
            log::warn!("mode response is not valid json: {}", err);
            OperatingMode::Unknown
        }
    }
}

/// Polls `GET {relay}/config` for `{ "mode": "<species>" | "stopped" }`.
pub struct HttpModeSource {
    agent: ureq::Agent,
    endpoint: String,
    stop_words: Vec<String>,
}

impl HttpModeSource {
    pub fn new(relay_url: &str, timeout: Duration, stop_words: Vec<String>) -> Result<Self> {
        url::Url::parse(relay_url).with_context(|| format!("invalid relay url {}", relay_url))?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            endpoint: format!("{}/config", relay_url.trim_end_matches('/')),
            stop_words,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn fetch(&self) -> Result<OperatingMode> {
        let response = self.agent.get(&self.endpoint).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => anyhow!("relay answered status {}", code),
            ureq::Error::Transport(transport) => anyhow!("relay unreachable: {}", transport),
        })?;
        let body = response.into_string().context("read mode response")?;
        Ok(mode_from_body(&body, &self.stop_words))
    }
}

impl ModeSource for HttpModeSource {
    fn poll(&mut self) -> OperatingMode {
        match self.fetch() {
            Ok(mode) => mode,
            Err(err) => {
                log::warn!("mode poll {} failed: {:#}", self.endpoint, err);
                OperatingMode::Unknown
            }
        }
    }
}
