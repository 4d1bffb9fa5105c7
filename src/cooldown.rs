//! Per-species alert cooldown.
//!
//! Timestamps live in memory only; restarting the daemon clears them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::mode::Species;

/// Cooldown observed in the field deployment.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct CooldownGate {
    default_cooldown: Duration,
    overrides: HashMap<Species, Duration>,
    last_alert: HashMap<Species, Instant>,
}

impl CooldownGate {
    pub fn new(default_cooldown: Duration) -> Self {
        Self {
            default_cooldown,
            overrides: HashMap::new(),
            last_alert: HashMap::new(),
        }
    }

    pub fn with_override(mut self, species: Species, cooldown: Duration) -> Self {
        self.overrides.insert(species, cooldown);
        self
    }

    pub fn cooldown(&self, species: &Species) -> Duration {
        self.overrides
            .get(species)
            .copied()
            .unwrap_or(self.default_cooldown)
    }

    /// True when no alert was recorded for `species`, or the cooldown has fully
    /// elapsed (the boundary itself is eligible).
    pub fn is_eligible(&self, species: &Species, now: Instant) -> bool {
        match self.last_alert.get(species) {
            None => true,
            Some(last) => now.saturating_duration_since(*last) >= self.cooldown(species),
        }
    }

    /// Record a dispatch attempt. Call after dispatching, whether or not it succeeded.
    pub fn record_alert(&mut self, species: &Species, now: Instant) {
        self.last_alert.insert(species.clone(), now);
    }

    pub fn last_alert(&self, species: &Species) -> Option<Instant> {
        self.last_alert.get(species).copied()
    }

    /// Time left before `species` is eligible again.
    pub fn remaining(&self, species: &Species, now: Instant) -> Duration {
        match self.last_alert.get(species) {
            None => Duration::ZERO,
            Some(last) => self
                .cooldown(species)
                .saturating_sub(now.saturating_duration_since(*last)),
        }
    }
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
