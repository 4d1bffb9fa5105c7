//! Alert construction and dispatch.
//!
//! The loop turns a detection summary into one alert per group (per class, or a
//! single collapsed label for configured species) and hands each alert plus an
//! annotated evidence frame to an `Alerter`. Dispatch failures are reported to
//! the loop, which logs and counts them; they never stop detection.

mod publish;
mod relay;

use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::detect::{ClassSummary, DetectionSummary};
use crate::frame::Frame;
use crate::mode::Species;

pub use publish::{EvidencePublisher, GithubPublisher, InlinePublisher, NoPublisher, PublishError};
pub use relay::RelayAlerter;

/// Species treated as threats when none are configured.
pub const DEFAULT_THREAT_SPECIES: &[&str] = &["intruders", "invasores"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Threat,
    Detection,
}

/// One notification for one detection group.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    /// Detected class (or collapsed label).
    pub species: String,
    /// Species the device was watching.
    pub mode: String,
    pub count: usize,
    pub confidence: f32,
    pub kind: AlertKind,
    pub title: String,
}

/// Outcome of a delivered alert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertReceipt {
    /// Published evidence location, when publishing succeeded.
    pub image_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("relay rejected alert with status {0}")]
    Rejected(u16),
    #[error("relay unreachable: {0}")]
    Transport(String),
}

/// Publishes evidence and notifies every subscribed operator.
///
/// A batch of alerts for one frame shares a single published evidence image:
/// callers publish once and notify per alert.
pub trait Alerter: Send {
    /// Publish the evidence frame. `None` means alerts go out without an image.
    fn publish_evidence(&mut self, evidence: &Frame) -> Option<String>;

    fn notify(&mut self, alert: &Alert, image_url: Option<&str>)
        -> Result<AlertReceipt, AlertError>;

    fn publish_and_notify(
        &mut self,
        alert: &Alert,
        evidence: &Frame,
    ) -> Result<AlertReceipt, AlertError> {
        let image_url = self.publish_evidence(evidence);
        self.notify(alert, image_url.as_deref())
    }
}

/// Decides alert kind, grouping and wording.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertPolicy {
    threat_species: Vec<Species>,
    collapsed_labels: HashMap<Species, String>,
}

impl AlertPolicy {
    pub fn new(threat_species: Vec<Species>, collapsed_labels: HashMap<Species, String>) -> Self {
        Self {
            threat_species,
            collapsed_labels,
        }
    }

    pub fn kind_for(&self, species: &Species) -> AlertKind {
        if self.threat_species.contains(species) {
            AlertKind::Threat
        } else {
            AlertKind::Detection
        }
    }

    /// Per-class groups, or a single group when `species` collapses its classes.
    pub fn groups(&self, species: &Species, summary: &DetectionSummary) -> Vec<ClassSummary> {
        if summary.is_empty() {
            return Vec::new();
        }
        match self.collapsed_labels.get(species) {
            Some(label) => vec![summary.collapsed(label)],
            None => summary.classes().to_vec(),
        }
    }

    pub fn title(kind: AlertKind, label: &str) -> String {
        match kind {
            AlertKind::Threat => format!("Threat alert: {}", label),
            AlertKind::Detection => format!("Detection: {}", label),
        }
    }

    pub fn build_alerts(&self, species: &Species, summary: &DetectionSummary) -> Vec<Alert> {
        let kind = self.kind_for(species);
        self.groups(species, summary)
            .into_iter()
            .map(|group| Alert {
                title: Self::title(kind, &group.label),
                species: group.label,
                mode: species.to_string(),
                count: group.count,
                confidence: group.mean_confidence,
                kind,
            })
            .collect()
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        let threat_species = DEFAULT_THREAT_SPECIES
            .iter()
            .filter_map(|id| Species::new(id).ok())
            .collect();
        Self::new(threat_species, HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};

    fn sp(id: &str) -> Species {
        Species::new(id).unwrap()
    }

    fn det(label: &str, confidence: f32) -> Detection {
        Detection {
            class_label: label.to_string(),
            confidence,
            bbox: BoundingBox {
                x: 0.1,
                y: 0.1,
                w: 0.2,
                h: 0.2,
            },
        }
    }

    #[test]
    fn intruders_are_threats_by_default() {
        let policy = AlertPolicy::default();
        assert_eq!(policy.kind_for(&sp("intruders")), AlertKind::Threat);
        assert_eq!(policy.kind_for(&sp("turtles")), AlertKind::Detection);
    }

    #[test]
    fn groups_per_class_in_first_seen_order() {
        let policy = AlertPolicy::default();
        let summary = DetectionSummary::from_detections(&[
            det("person", 0.9),
            det("dog", 0.8),
            det("person", 0.7),
        ]);
        let alerts = policy.build_alerts(&sp("intruders"), &summary);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].species, "person");
        assert_eq!(alerts[0].count, 2);
        assert!((alerts[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(alerts[0].title, "Threat alert: person");
        assert_eq!(alerts[1].species, "dog");
        assert_eq!(alerts[1].mode, "intruders");
    }

    #[test]
    fn collapsed_species_yield_one_alert() {
        let mut collapsed = HashMap::new();
        collapsed.insert(sp("terns"), "tern colony".to_string());
        let policy = AlertPolicy::new(Vec::new(), collapsed);
        let summary = DetectionSummary::from_detections(&[
            det("sandwich tern", 0.9),
            det("common tern", 0.8),
            det("common tern", 0.8),
        ]);
        let alerts = policy.build_alerts(&sp("terns"), &summary);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].species, "tern colony");
        assert_eq!(alerts[0].count, 3);
        assert_eq!(alerts[0].kind, AlertKind::Detection);
        assert_eq!(alerts[0].title, "Detection: tern colony");
    }

    #[test]
    fn empty_summary_yields_no_alerts() {
        let policy = AlertPolicy::default();
        assert!(policy
            .build_alerts(&sp("turtles"), &DetectionSummary::default())
            .is_empty());
    }

    #[test]
    fn kind_serializes_lowercase() {
        let value = serde_json::to_value(AlertKind::Threat).unwrap();
        assert_eq!(value, serde_json::json!("threat"));
    }
}
