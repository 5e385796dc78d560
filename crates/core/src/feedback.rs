//! Feedback model - outcome reports about earlier decisions.

use crate::id::{DecisionId, FeedbackId};
use crate::Time;
use serde::{Deserialize, Serialize};

/// Reported outcome of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The decision was right
    Success,
    /// The decision was wrong
    Fail,
    /// Not stated
    #[default]
    Unknown,
}

impl Outcome {
    /// Lenient parse; anything unrecognized is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "success" | "correct" | "ok" | "positive" | "true" => Self::Success,
            "fail" | "failure" | "wrong" | "incorrect" | "negative" | "false" => Self::Fail,
            _ => Self::Unknown,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Unknown => "unknown",
        }
    }
}

/// Direction a feedback item pushes its rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Counts as a success, raises weight
    Positive,
    /// Counts as a failure, lowers weight
    Negative,
}

/// Classify an outcome/score pair. The outcome wins when stated; otherwise
/// the sign of a non-zero finite score decides.
pub fn verdict_of(outcome: Outcome, score: Option<f64>) -> Option<Verdict> {
    match outcome {
        Outcome::Success => Some(Verdict::Positive),
        Outcome::Fail => Some(Verdict::Negative),
        Outcome::Unknown => match score {
            Some(s) if s.is_finite() && s > 0.0 => Some(Verdict::Positive),
            Some(s) if s.is_finite() && s < 0.0 => Some(Verdict::Negative),
            _ => None,
        },
    }
}

/// A stored feedback item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Unique identifier
    pub id: FeedbackId,
    /// Decision being judged
    pub decision_id: DecisionId,
    /// Reported outcome
    pub outcome: Outcome,
    /// Optional numeric score
    pub score: Option<f64>,
    /// When it was received
    pub created_at: Time,
}

impl Feedback {
    /// Classification shared by weight updates and statistics.
    pub fn verdict(&self) -> Option<Verdict> {
        verdict_of(self.outcome, self.score)
    }
}

/// A feedback item not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFeedback {
    /// Decision being judged
    pub decision_id: DecisionId,
    /// Reported outcome
    pub outcome: Outcome,
    /// Optional numeric score
    pub score: Option<f64>,
    /// Receive time
    pub created_at: Time,
}

impl NewFeedback {
    /// Create a new feedback item.
    pub fn new(decision_id: DecisionId, outcome: Outcome, score: Option<f64>) -> Self {
        Self {
            decision_id,
            outcome,
            score,
            created_at: chrono::Utc::now(),
        }
    }

    /// Classification shared by weight updates and statistics.
    pub fn verdict(&self) -> Option<Verdict> {
        verdict_of(self.outcome, self.score)
    }

    /// Attach the id the store assigned.
    pub fn into_feedback(self, id: FeedbackId) -> Feedback {
        Feedback {
            id,
            decision_id: self.decision_id,
            outcome: self.outcome,
            score: self.score,
            created_at: self.created_at,
        }
    }
}
