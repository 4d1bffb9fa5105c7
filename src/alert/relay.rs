use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;

use super::publish::{EvidencePublisher, PublishError};
use super::{Alert, AlertError, AlertReceipt, Alerter};
use crate::frame::Frame;

/// Header carrying the shared alert key.
pub const ALERT_KEY_HEADER: &str = "X-ALERTA-KEY";

#[derive(Serialize)]
struct RelayPayload<'a> {
    #[serde(flatten)]
    alert: &'a Alert,
    image: Option<&'a str>,
}

/// Posts alerts to `{relay}/alerta`; the relay fans them out to subscribers.
pub struct RelayAlerter {
    agent: ureq::Agent,
    endpoint: String,
    alert_key: Option<String>,
    publisher: Box<dyn EvidencePublisher>,
    jpeg_quality: u8,
}

impl RelayAlerter {
    pub fn new(
        relay_url: &str,
        alert_key: Option<String>,
        timeout: Duration,
        publisher: Box<dyn EvidencePublisher>,
        jpeg_quality: u8,
    ) -> Result<Self> {
        url::Url::parse(relay_url).with_context(|| format!("invalid relay url {}", relay_url))?;
        if alert_key.is_none() {
            log::warn!("no alert key configured; alerts are sent without {}", ALERT_KEY_HEADER);
        }
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: format!("{}/alerta", relay_url.trim_end_matches('/')),
            alert_key,
            publisher,
            jpeg_quality,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Alerter for RelayAlerter {
    fn publish_evidence(&mut self, evidence: &Frame) -> Option<String> {
        let jpeg = match evidence.encode_jpeg(self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!("evidence encoding failed: {:#}", err);
                return None;
            }
        };
        match self.publisher.publish(&jpeg) {
            Ok(url) => Some(url),
            Err(PublishError::Disabled) => None,
            Err(err) => {
                log::warn!(
                    "{} evidence publish failed, alert goes out without image: {}",
                    self.publisher.name(),
                    err
                );
                None
            }
        }
    }

    fn notify(
        &mut self,
        alert: &Alert,
        image_url: Option<&str>,
    ) -> Result<AlertReceipt, AlertError> {
        let payload = RelayPayload {
            alert,
            image: image_url,
        };

        let mut request = self.agent.post(&self.endpoint);
        if let Some(key) = &self.alert_key {
            request = request.set(ALERT_KEY_HEADER, key);
        }
        request.send_json(&payload).map_err(|err| match err {
            ureq::Error::Status(code, _) => AlertError::Rejected(code),
            ureq::Error::Transport(transport) => AlertError::Transport(transport.to_string()),
        })?;

        log::info!(
            "alert sent: {} x{} ({:.2}) while watching {}",
            alert.species,
            alert.count,
            alert.confidence,
            alert.mode
        );
        Ok(AlertReceipt {
            image_url: image_url.map(str::to_string),
        })
    }
}
