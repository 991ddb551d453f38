// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::agent::AgentId;

/// Default planned-action duration when the planner provides none.
pub const DEFAULT_INTENT_DURATION_S: f64 = 60.0;

/// Upper bound for `duration_s` (one week). Keeps the window arithmetic in
/// [`IntentMessage::ends_at`] far away from the `i64` millisecond range.
pub const MAX_INTENT_DURATION_S: f64 = 604_800.0;

/// Priority tiers for planned actions, ordered by precedence.
///
/// `Safety` outranks everything; conflict scoring dampens collisions with
/// safety intents so they are never vetoed by lower-priority plans.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum IntentPriority {
    Availability = 1,
    Performance = 2,
    Safety = 3,
}

/// A planned-action announcement.
///
/// Peers score announced intents against their own active plans before
/// execution; `conflict_score` is stamped by the broadcaster, normalized to
/// `[0, 1]`.
///
/// Geometry convention: if `parameters` carries a numeric `target_angle`
/// (degrees), geometric overlap is computed from angular separation; an
/// intent without one is treated as fully overlapping (conservative).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMessage {
    pub action_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub priority: IntentPriority,
    pub sender: AgentId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "duration")]
    pub duration_s: f64,
    pub conflict_score: f64,
}

impl IntentMessage {
    pub fn new(
        action_type: impl Into<String>,
        parameters: Map<String, Value>,
        priority: IntentPriority,
        sender: AgentId,
    ) -> Result<Self, IntentError> {
        let intent = Self {
            action_type: action_type.into(),
            parameters,
            priority,
            sender,
            timestamp: Utc::now(),
            duration_s: DEFAULT_INTENT_DURATION_S,
            conflict_score: 0.0,
        };
        intent.validate()?;
        Ok(intent)
    }

    pub fn with_duration(mut self, duration_s: f64) -> Self {
        self.duration_s = duration_s;
        self
    }

    /// Copy of this intent with the broadcaster's score stamped on it.
    pub fn with_conflict_score(mut self, conflict_score: f64) -> Self {
        self.conflict_score = conflict_score;
        self
    }

    /// Re-check invariants. The broadcaster validates before every publish
    /// so mutated copies cannot leak invalid values onto the wire.
    pub fn validate(&self) -> Result<(), IntentError> {
        if self.action_type.is_empty() {
            return Err(IntentError::EmptyActionType);
        }
        if !self.duration_s.is_finite()
            || self.duration_s <= 0.0
            || self.duration_s > MAX_INTENT_DURATION_S
        {
            return Err(IntentError::InvalidDuration(self.duration_s));
        }
        if !(0.0..=1.0).contains(&self.conflict_score) {
            return Err(IntentError::ConflictScoreOutOfRange(self.conflict_score));
        }
        Ok(())
    }

    /// Pointing direction in degrees, when the planner supplied one.
    pub fn target_angle(&self) -> Option<f64> {
        self.parameters.get("target_angle").and_then(Value::as_f64)
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.timestamp + Duration::milliseconds((self.duration_s * 1000.0) as i64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("action_type cannot be empty")]
    EmptyActionType,

    #[error("duration must be a positive number of seconds up to {MAX_INTENT_DURATION_S}, got {0}")]
    InvalidDuration(f64),

    #[error("conflict_score must be between 0.0 and 1.0, got {0}")]
    ConflictScoreOutOfRange(f64),
}
