//! Decision recording.

use std::sync::Arc;

use genealogy_core::{Decision, EventId, NewDecision, Rule};
use genealogy_storage::{Storage, StorageError};
use serde_json::{json, Value};
use tracing::debug;

/// Response used when no rule matches: observe and log, take no action.
pub fn default_response() -> Value {
    json!({"mode": "observe", "decision": "log"})
}

/// What to record when no rule matched.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Response returned and stored for unmatched events
    pub default_response: Value,
    /// Confidence stored for unmatched events
    pub default_confidence: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            default_response: default_response(),
            default_confidence: 1.0,
        }
    }
}

/// Appends decisions to the decision log.
pub struct DecisionRecorder {
    storage: Arc<dyn Storage>,
    config: RecorderConfig,
}

impl DecisionRecorder {
    /// Create a new recorder.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            config: RecorderConfig::default(),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: RecorderConfig) -> Self {
        self.config = config;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Persist the decision for `event_id`.
    ///
    /// The returned decision always has a backing record; a failed write is
    /// returned as an error and nothing is fabricated.
    pub async fn record(&self, event_id: EventId, rule: Option<&Rule>) -> Result<Decision, StorageError> {
        let pending = match rule {
            Some(rule) => NewDecision {
                event_id,
                rule_id: Some(rule.id),
                response: rule.response.clone(),
                confidence: rule.weight,
                created_at: chrono::Utc::now(),
            },
            None => NewDecision {
                event_id,
                rule_id: None,
                response: self.config.default_response.clone(),
                confidence: self.config.default_confidence,
                created_at: chrono::Utc::now(),
            },
        };

        let id = self.storage.insert_decision(&pending).await?;
        debug!("Recorded decision {} for event {} (rule {:?})", id, event_id, pending.rule_id);

        Ok(pending.into_decision(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::BrokenStorage;
    use genealogy_core::{NewRule, Pattern, RuleId};
    use genealogy_storage::JsonStorage;

    #[tokio::test]
    async fn test_records_winning_rule() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
        let rule = storage
            .insert_rule(&NewRule::new(Pattern::empty(), json!({"mode": "block"}), 3.5))
            .await
            .unwrap();

        let recorder = DecisionRecorder::new(storage.clone());
        let decision = recorder.record(EventId(1), Some(&rule)).await.unwrap();

        assert_eq!(decision.rule_id, Some(rule.id));
        assert_eq!(decision.response, json!({"mode": "block"}));
        assert_eq!(decision.confidence, 3.5);

        let stored = storage.get_decision(decision.id).await.unwrap().unwrap();
        assert_eq!(stored, decision);

        // Recording never touches the rule.
        assert_eq!(storage.get_rule(rule.id).await.unwrap().unwrap(), rule);
    }

    #[tokio::test]
    async fn test_records_default_when_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
        let recorder = DecisionRecorder::new(storage).with_config(RecorderConfig {
            default_response: json!({"mode": "allow"}),
            default_confidence: 0.5,
        });

        let decision = recorder.record(EventId(9), None).await.unwrap();
        assert_eq!(decision.rule_id, None);
        assert_eq!(decision.response, json!({"mode": "allow"}));
        assert_eq!(decision.confidence, 0.5);
        assert_eq!(decision.event_id, EventId(9));
    }

    #[tokio::test]
    async fn test_storage_failure_is_surfaced() {
        let recorder = DecisionRecorder::new(Arc::new(BrokenStorage));
        let rule = NewRule::new(Pattern::empty(), json!({}), 1.0).into_rule(RuleId(1));

        let err = recorder.record(EventId(1), Some(&rule)).await.unwrap_err();
        assert!(matches!(err, StorageError::Other(_)));
    }
}
