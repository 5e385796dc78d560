//! Decision model - the fact of which rule answered which event.

use crate::id::{DecisionId, EventId, RuleId};
use crate::Time;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A recorded decision. Never edited after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Unique identifier
    pub id: DecisionId,
    /// Event that was decided
    pub event_id: EventId,
    /// Winning rule; `None` when the default response was used
    pub rule_id: Option<RuleId>,
    /// Response actually returned
    pub response: Value,
    /// Winning rule's weight at decision time, or the default confidence
    pub confidence: f64,
    /// When it was recorded
    pub created_at: Time,
}

/// A decision not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDecision {
    /// Event that was decided
    pub event_id: EventId,
    /// Winning rule
    pub rule_id: Option<RuleId>,
    /// Response returned
    pub response: Value,
    /// Confidence snapshot
    pub confidence: f64,
    /// Record time
    pub created_at: Time,
}

impl NewDecision {
    /// Attach the id the store assigned.
    pub fn into_decision(self, id: DecisionId) -> Decision {
        Decision {
            id,
            event_id: self.event_id,
            rule_id: self.rule_id,
            response: self.response,
            confidence: self.confidence,
            created_at: self.created_at,
        }
    }
}
