//! Storage trait abstraction.

use std::time::Duration;

use async_trait::async_trait;
use genealogy_core::{
    Decision, DecisionId, Event, EventId, Feedback, FeedbackId, LineageId, NewDecision, NewEvent,
    NewFeedback, NewRule, Rule, RuleId,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A lock stayed held by someone else for too long
    #[error("busy: {0}")]
    Busy(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Storage abstraction for the rule registry and its history.
///
/// Every method takes `&self`; implementations synchronize internally so a
/// single store can be shared as `Arc<dyn Storage>` by concurrent requests.
/// Events, decisions and feedback are append-only.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Rule operations ===

    /// All rules with `active = true`, ordered by id.
    async fn get_active_rules(&self) -> Result<Vec<Rule>>;

    /// All rules, active or not, ordered by id.
    async fn list_rules(&self) -> Result<Vec<Rule>>;

    /// Load a rule by ID.
    async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>>;

    /// Every rule in a lineage, ordered by id.
    async fn get_rules_by_lineage(&self, lineage: LineageId) -> Result<Vec<Rule>>;

    /// Insert a rule and return it with its assigned id.
    async fn insert_rule(&self, rule: &NewRule) -> Result<Rule>;

    /// Overwrite a rule's weight (clamped at 0).
    async fn update_rule_weight(&self, id: RuleId, weight: f64) -> Result<Rule>;

    /// Atomically add `delta` to a rule's weight, clamping at 0.
    async fn adjust_rule_weight(&self, id: RuleId, delta: f64) -> Result<Rule>;

    /// Deactivate rules; returns how many were active before the call.
    async fn deactivate_rules(&self, ids: &[RuleId]) -> Result<u64>;

    /// Operator switch for a single rule.
    async fn set_rule_active(&self, id: RuleId, active: bool) -> Result<Rule>;

    // === Event operations ===

    /// Append an event.
    async fn insert_event(&self, event: &NewEvent) -> Result<EventId>;

    /// Load an event by ID.
    async fn get_event(&self, id: EventId) -> Result<Option<Event>>;

    // === Decision operations ===

    /// Append a decision.
    async fn insert_decision(&self, decision: &NewDecision) -> Result<DecisionId>;

    /// Load a decision by ID.
    async fn get_decision(&self, id: DecisionId) -> Result<Option<Decision>>;

    /// Decisions won by any of the given rules.
    async fn get_decisions_by_rule_ids(&self, ids: &[RuleId]) -> Result<Vec<Decision>>;

    // === Feedback operations ===

    /// Append a feedback item.
    async fn insert_feedback(&self, feedback: &NewFeedback) -> Result<FeedbackId>;

    /// Feedback on any of the given decisions.
    async fn get_feedback_by_decision_ids(&self, ids: &[DecisionId]) -> Result<Vec<Feedback>>;

    // === Leases ===

    /// Try to take the named lease for `holder`.
    ///
    /// Leases are visible to every process sharing the store. A lease taken
    /// more than `ttl` ago is presumed abandoned and may be taken over.
    /// Returns whether `holder` owns the lease afterwards.
    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Give up a lease. Does nothing if `holder` does not own it.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;

    /// Check the backend is reachable.
    async fn health_check(&self) -> bool;
}
