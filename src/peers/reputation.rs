//! Reputation Module
//!
//! Turns sync outcomes into a reliability score in [0, 1]. Successes earn a
//! small bonus; failures and integrity violations cost considerably more, so a
//! misbehaving peer sinks quickly and recovers slowly.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::unix_millis;

/// Outcome of an interaction that moves a peer's reputation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationOutcome {
    SuccessfulSync,
    SyncFailure,
    IntegrityViolation,
    /// Confirmed node failure reported by recovery
    NodeFailure,
}

/// Configuration for the reputation system
#[derive(Debug, Clone)]
pub struct ReputationConfig {
    /// Reliability of a newly added peer
    pub baseline: f64,
    pub success_bonus: f64,
    pub failure_penalty: f64,
    pub integrity_penalty: f64,
    pub node_failure_penalty: f64,
    /// Events kept per peer
    pub max_history: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            baseline: 0.5,
            success_bonus: 0.02,
            failure_penalty: 0.1,
            integrity_penalty: 0.25,
            node_failure_penalty: 0.4,
            max_history: 64,
        }
    }
}

impl ReputationConfig {
    /// Signed change applied for an outcome
    pub fn delta(&self, outcome: ReputationOutcome) -> f64 {
        match outcome {
            ReputationOutcome::SuccessfulSync => self.success_bonus,
            ReputationOutcome::SyncFailure => -self.failure_penalty,
            ReputationOutcome::IntegrityViolation => -self.integrity_penalty,
            ReputationOutcome::NodeFailure => -self.node_failure_penalty,
        }
    }
}

/// Individual reputation event
#[derive(Debug, Clone)]
pub struct ReputationEvent {
    pub outcome: ReputationOutcome,
    pub delta: f64,
    pub timestamp: u64,
}

/// Reputation history for a single peer
#[derive(Debug, Clone)]
pub struct PeerReputation {
    score: f64,
    events: VecDeque<ReputationEvent>,
    total_positive: f64,
    total_negative: f64,
    interaction_count: u64,
}

impl PeerReputation {
    pub fn new(baseline: f64) -> Self {
        Self {
            score: baseline.clamp(0.0, 1.0),
            events: VecDeque::new(),
            total_positive: 0.0,
            total_negative: 0.0,
            interaction_count: 0,
        }
    }

    /// Apply an outcome and return the new score
    pub fn record(&mut self, outcome: ReputationOutcome, config: &ReputationConfig) -> f64 {
        let delta = config.delta(outcome);

        if delta > 0.0 {
            self.total_positive += delta;
        } else {
            self.total_negative += -delta;
        }

        self.score = (self.score + delta).clamp(0.0, 1.0);
        self.interaction_count += 1;

        self.events.push_back(ReputationEvent {
            outcome,
            delta,
            timestamp: unix_millis(),
        });
        while self.events.len() > config.max_history {
            self.events.pop_front();
        }

        self.score
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn interactions(&self) -> u64 {
        self.interaction_count
    }

    /// Share of reputation movement that was positive
    pub fn positive_ratio(&self) -> f64 {
        let total = self.total_positive + self.total_negative;
        if total > 0.0 {
            self.total_positive / total
        } else {
            0.5
        }
    }

    pub fn events(&self) -> &VecDeque<ReputationEvent> {
        &self.events
    }
}
