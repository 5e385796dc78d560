//! Storage wrapper that fails selected calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genealogy_core::{
    Decision, DecisionId, Event, EventId, Feedback, FeedbackId, LineageId, NewDecision, NewEvent,
    NewFeedback, NewRule, Rule, RuleId,
};
use genealogy_storage::{Result, Storage, StorageError};

/// Delegates to `inner` except for the calls switched to fail.
pub(crate) struct FlakyStorage {
    inner: Arc<dyn Storage>,
    fail_reads: bool,
    fail_insert: bool,
    fail_deactivate: bool,
    stale_rule_list: bool,
}

impl FlakyStorage {
    pub(crate) fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            fail_reads: false,
            fail_insert: false,
            fail_deactivate: false,
            stale_rule_list: false,
        }
    }

    pub(crate) fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub(crate) fn failing_insert(mut self) -> Self {
        self.fail_insert = true;
        self
    }

    pub(crate) fn failing_deactivate(mut self) -> Self {
        self.fail_deactivate = true;
        self
    }

    /// Serve every rule as the active set, as a read taken before some of
    /// them were switched off would.
    pub(crate) fn stale_rule_list(mut self) -> Self {
        self.stale_rule_list = true;
        self
    }
}

fn injected<T>(call: &str) -> Result<T> {
    Err(StorageError::Database(format!("injected failure in {}", call)))
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn get_active_rules(&self) -> Result<Vec<Rule>> {
        if self.fail_reads {
            return injected("get_active_rules");
        }
        if self.stale_rule_list {
            let mut rules = self.inner.list_rules().await?;
            for rule in &mut rules {
                rule.active = true;
            }
            return Ok(rules);
        }
        self.inner.get_active_rules().await
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        self.inner.list_rules().await
    }

    async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        self.inner.get_rule(id).await
    }

    async fn get_rules_by_lineage(&self, lineage: LineageId) -> Result<Vec<Rule>> {
        self.inner.get_rules_by_lineage(lineage).await
    }

    async fn insert_rule(&self, rule: &NewRule) -> Result<Rule> {
        if self.fail_insert {
            return injected("insert_rule");
        }
        self.inner.insert_rule(rule).await
    }

    async fn update_rule_weight(&self, id: RuleId, weight: f64) -> Result<Rule> {
        self.inner.update_rule_weight(id, weight).await
    }

    async fn adjust_rule_weight(&self, id: RuleId, delta: f64) -> Result<Rule> {
        self.inner.adjust_rule_weight(id, delta).await
    }

    async fn deactivate_rules(&self, ids: &[RuleId]) -> Result<u64> {
        if self.fail_deactivate {
            return injected("deactivate_rules");
        }
        self.inner.deactivate_rules(ids).await
    }

    async fn set_rule_active(&self, id: RuleId, active: bool) -> Result<Rule> {
        self.inner.set_rule_active(id, active).await
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<EventId> {
        self.inner.insert_event(event).await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        self.inner.get_event(id).await
    }

    async fn insert_decision(&self, decision: &NewDecision) -> Result<DecisionId> {
        self.inner.insert_decision(decision).await
    }

    async fn get_decision(&self, id: DecisionId) -> Result<Option<Decision>> {
        self.inner.get_decision(id).await
    }

    async fn get_decisions_by_rule_ids(&self, ids: &[RuleId]) -> Result<Vec<Decision>> {
        self.inner.get_decisions_by_rule_ids(ids).await
    }

    async fn insert_feedback(&self, feedback: &NewFeedback) -> Result<FeedbackId> {
        self.inner.insert_feedback(feedback).await
    }

    async fn get_feedback_by_decision_ids(&self, ids: &[DecisionId]) -> Result<Vec<Feedback>> {
        self.inner.get_feedback_by_decision_ids(ids).await
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.inner.try_acquire_lease(name, holder, ttl).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        self.inner.release_lease(name, holder).await
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }
}
