//! Storage doubles for tests.

use std::time::Duration;

use async_trait::async_trait;
use genealogy_core::{
    Decision, DecisionId, Event, EventId, Feedback, FeedbackId, LineageId, NewDecision, NewEvent,
    NewFeedback, NewRule, Rule, RuleId,
};
use genealogy_storage::{Result, Storage, StorageError};

fn down<T>() -> Result<T> {
    Err(StorageError::Other("storage unavailable".to_string()))
}

/// A store whose every call fails.
pub(crate) struct BrokenStorage;

#[async_trait]
impl Storage for BrokenStorage {
    async fn get_active_rules(&self) -> Result<Vec<Rule>> { down() }
    async fn list_rules(&self) -> Result<Vec<Rule>> { down() }
    async fn get_rule(&self, _id: RuleId) -> Result<Option<Rule>> { down() }
    async fn get_rules_by_lineage(&self, _lineage: LineageId) -> Result<Vec<Rule>> { down() }
    async fn insert_rule(&self, _rule: &NewRule) -> Result<Rule> { down() }
    async fn update_rule_weight(&self, _id: RuleId, _weight: f64) -> Result<Rule> { down() }
    async fn adjust_rule_weight(&self, _id: RuleId, _delta: f64) -> Result<Rule> { down() }
    async fn deactivate_rules(&self, _ids: &[RuleId]) -> Result<u64> { down() }
    async fn set_rule_active(&self, _id: RuleId, _active: bool) -> Result<Rule> { down() }
    async fn insert_event(&self, _event: &NewEvent) -> Result<EventId> { down() }
    async fn get_event(&self, _id: EventId) -> Result<Option<Event>> { down() }
    async fn insert_decision(&self, _decision: &NewDecision) -> Result<DecisionId> { down() }
    async fn get_decision(&self, _id: DecisionId) -> Result<Option<Decision>> { down() }
    async fn get_decisions_by_rule_ids(&self, _ids: &[RuleId]) -> Result<Vec<Decision>> { down() }
    async fn insert_feedback(&self, _feedback: &NewFeedback) -> Result<FeedbackId> { down() }
    async fn get_feedback_by_decision_ids(&self, _ids: &[DecisionId]) -> Result<Vec<Feedback>> { down() }
    async fn try_acquire_lease(&self, _name: &str, _holder: &str, _ttl: Duration) -> Result<bool> { down() }
    async fn release_lease(&self, _name: &str, _holder: &str) -> Result<()> { down() }
    async fn health_check(&self) -> bool { false }
}

/// Serves rules normally but refuses to write decisions.
pub(crate) struct ReadOnlyStorage {
    pub(crate) rules: Vec<Rule>,
}

#[async_trait]
impl Storage for ReadOnlyStorage {
    async fn get_active_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.iter().filter(|r| r.active).cloned().collect())
    }
    async fn list_rules(&self) -> Result<Vec<Rule>> { Ok(self.rules.clone()) }
    async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        Ok(self.rules.iter().find(|r| r.id == id).cloned())
    }
    async fn get_rules_by_lineage(&self, _lineage: LineageId) -> Result<Vec<Rule>> { down() }
    async fn insert_rule(&self, _rule: &NewRule) -> Result<Rule> { down() }
    async fn update_rule_weight(&self, _id: RuleId, _weight: f64) -> Result<Rule> { down() }
    async fn adjust_rule_weight(&self, _id: RuleId, _delta: f64) -> Result<Rule> { down() }
    async fn deactivate_rules(&self, _ids: &[RuleId]) -> Result<u64> { down() }
    async fn set_rule_active(&self, _id: RuleId, _active: bool) -> Result<Rule> { down() }
    async fn insert_event(&self, _event: &NewEvent) -> Result<EventId> { Ok(EventId(1)) }
    async fn get_event(&self, _id: EventId) -> Result<Option<Event>> { Ok(None) }
    async fn insert_decision(&self, _decision: &NewDecision) -> Result<DecisionId> { down() }
    async fn get_decision(&self, _id: DecisionId) -> Result<Option<Decision>> { Ok(None) }
    async fn get_decisions_by_rule_ids(&self, _ids: &[RuleId]) -> Result<Vec<Decision>> { Ok(vec![]) }
    async fn insert_feedback(&self, _feedback: &NewFeedback) -> Result<FeedbackId> { down() }
    async fn get_feedback_by_decision_ids(&self, _ids: &[DecisionId]) -> Result<Vec<Feedback>> { Ok(vec![]) }
    async fn try_acquire_lease(&self, _name: &str, _holder: &str, _ttl: Duration) -> Result<bool> { down() }
    async fn release_lease(&self, _name: &str, _holder: &str) -> Result<()> { down() }
    async fn health_check(&self) -> bool { true }
}
