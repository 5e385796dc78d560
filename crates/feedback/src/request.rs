//! Feedback request parsing.

use genealogy_core::{DecisionId, NewFeedback, Outcome, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A validated feedback submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    /// Decision being judged
    pub decision_id: DecisionId,
    /// Reported outcome
    #[serde(default)]
    pub outcome: Outcome,
    /// Optional numeric score
    #[serde(default)]
    pub score: Option<f64>,
}

impl FeedbackRequest {
    /// Create a new request.
    pub fn new(decision_id: DecisionId, outcome: Outcome) -> Self {
        Self {
            decision_id,
            outcome,
            score: None,
        }
    }

    /// Attach a score.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Parse a loosely-typed body.
    ///
    /// `decision_id` must be a positive integer. `outcome` is parsed leniently
    /// and defaults to unknown. `score` must be finite when present.
    pub fn from_json(body: &Value) -> Result<Self, ValidationError> {
        let body = body.as_object().ok_or_else(|| {
            ValidationError::InvalidRequest("request body must be a JSON object".to_string())
        })?;

        let decision_id = match body.get("decision_id") {
            None | Some(Value::Null) => return Err(ValidationError::MissingField("decision_id")),
            Some(value) => match value.as_i64() {
                Some(id) if id > 0 => DecisionId(id),
                _ => return Err(ValidationError::invalid("decision_id", "must be a positive integer")),
            },
        };

        let outcome = match body.get("outcome") {
            None | Some(Value::Null) => Outcome::Unknown,
            Some(Value::String(s)) => Outcome::parse(s),
            Some(_) => return Err(ValidationError::invalid("outcome", "must be a string")),
        };

        let score = match body.get("score") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_f64() {
                Some(s) if s.is_finite() => Some(s),
                _ => return Err(ValidationError::invalid("score", "must be a finite number")),
            },
        };

        Ok(Self {
            decision_id,
            outcome,
            score,
        })
    }

    pub(crate) fn to_new_feedback(&self) -> NewFeedback {
        NewFeedback::new(self.decision_id, self.outcome, self.score)
    }
}
