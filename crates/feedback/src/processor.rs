//! Feedback processor - records outcomes and nudges rule weights.

use std::sync::Arc;

use genealogy_core::{DecisionId, FeedbackId, RuleId, ValidationError, Verdict};
use genealogy_storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::FeedbackRequest;

/// Weight change per feedback item.
pub const DEFAULT_STEP: f64 = 0.1;

/// Errors raised while applying feedback.
#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    /// Request was malformed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No decision with that id
    #[error("decision not found: {0}")]
    DecisionNotFound(DecisionId),

    /// A read or write against the store failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration for the feedback processor.
#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    /// Amount added on a positive verdict and removed on a negative one
    pub step: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self { step: DEFAULT_STEP }
    }
}

/// Result of applying one feedback item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResult {
    /// Stored feedback item
    pub feedback_id: FeedbackId,
    /// Decision that was judged
    pub decision_id: DecisionId,
    /// Rule behind the decision, if any
    pub rule_id: Option<RuleId>,
    /// Whether a rule weight changed
    pub updated: bool,
    /// Weight after the change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_weight: Option<f64>,
}

/// One item of a batch that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Position in the submitted batch
    pub index: usize,
    /// Decision the item referred to
    pub decision_id: DecisionId,
    /// What went wrong
    pub error: String,
}

/// Outcome of a feedback batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Items applied
    pub applied: Vec<FeedbackResult>,
    /// Items rejected
    pub failed: Vec<BatchFailure>,
}

/// Applies feedback to the decision log and the rule registry.
pub struct FeedbackProcessor {
    storage: Arc<dyn Storage>,
    config: FeedbackConfig,
}

impl FeedbackProcessor {
    /// Create a new processor.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            config: FeedbackConfig::default(),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: FeedbackConfig) -> Self {
        self.config = config;
        self
    }

    /// Record one feedback item and adjust the decision's rule.
    ///
    /// The item is stored before any weight change. Items without a verdict
    /// and decisions without a rule leave weights alone.
    pub async fn apply_feedback(&self, request: FeedbackRequest) -> Result<FeedbackResult, FeedbackError> {
        if request.score.is_some_and(|s| !s.is_finite()) {
            return Err(ValidationError::invalid("score", "must be a finite number").into());
        }

        let decision = self
            .storage
            .get_decision(request.decision_id)
            .await?
            .ok_or(FeedbackError::DecisionNotFound(request.decision_id))?;

        let pending = request.to_new_feedback();
        let feedback_id = self.storage.insert_feedback(&pending).await?;
        debug!(
            "Stored feedback {} ({}) for decision {}",
            feedback_id,
            pending.outcome.as_str(),
            decision.id
        );

        let mut result = FeedbackResult {
            feedback_id,
            decision_id: decision.id,
            rule_id: decision.rule_id,
            updated: false,
            new_weight: None,
        };

        let (Some(rule_id), Some(verdict)) = (decision.rule_id, pending.verdict()) else {
            return Ok(result);
        };

        let delta = match verdict {
            Verdict::Positive => self.config.step,
            Verdict::Negative => -self.config.step,
        };
        let rule = self.storage.adjust_rule_weight(rule_id, delta).await?;
        info!("Rule {} weight now {} after feedback {}", rule.id, rule.weight, feedback_id);

        result.updated = true;
        result.new_weight = Some(rule.weight);
        Ok(result)
    }

    /// Apply every item independently; one failure does not stop the rest.
    pub async fn apply_batch(&self, requests: Vec<FeedbackRequest>) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, request) in requests.into_iter().enumerate() {
            let decision_id = request.decision_id;
            match self.apply_feedback(request).await {
                Ok(result) => report.applied.push(result),
                Err(e) => {
                    warn!("Feedback item {} (decision {}) failed: {}", index, decision_id, e);
                    report.failed.push(BatchFailure {
                        index,
                        decision_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Applied feedback batch: {} ok, {} failed",
            report.applied.len(),
            report.failed.len()
        );
        report
    }
}
