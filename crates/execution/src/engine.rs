//! The decision engine - turns an event into a recorded decision.

use std::sync::Arc;

use genealogy_core::{
    DecisionId, Event, EventId, LineageId, Metadata, NewEvent, Pattern, Rule, RuleId, RuleOrigin,
    ValidationError,
};
use genealogy_storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{DecisionRecorder, RecorderConfig, RuleSelector, SelectorStrategy, WeightedSelector};

const DEFAULT_EVENT_TYPE: &str = "event";

/// Errors raised by [`DecisionEngine`].
#[derive(Debug, thiserror::Error)]
pub enum DecideError {
    /// Request was malformed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A read or write against the store failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration for the decision engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// What to record when nothing matches
    pub recorder: RecorderConfig,
    /// Break exact weight ties by pattern specificity
    pub prefer_specific: bool,
}

/// An event submitted for a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecideRequest {
    /// Event type
    pub event_type: String,
    /// Fields rules are matched against
    pub metadata: Metadata,
    /// Opaque caller context
    pub context: Metadata,
}

impl DecideRequest {
    /// Create a new request.
    pub fn new(event_type: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            event_type: event_type.into(),
            metadata,
            context: Metadata::new(),
        }
    }

    /// Attach caller context.
    pub fn with_context(mut self, context: Metadata) -> Self {
        self.context = context;
        self
    }

    /// Parse a loosely-typed request body.
    ///
    /// `event_type` defaults to `"event"`; `metadata` and `context` default
    /// to empty objects.
    pub fn from_json(body: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut body) = body else {
            return Err(ValidationError::InvalidRequest(
                "request body must be a JSON object".to_string(),
            ));
        };

        let event_type = match body.remove("event_type") {
            None | Some(Value::Null) => DEFAULT_EVENT_TYPE.to_string(),
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(Value::String(_)) => {
                return Err(ValidationError::invalid("event_type", "must not be empty"))
            }
            Some(_) => return Err(ValidationError::invalid("event_type", "must be a string")),
        };

        Ok(Self {
            event_type,
            metadata: object_field(&mut body, "metadata")?,
            context: object_field(&mut body, "context")?,
        })
    }
}

fn object_field(body: &mut Metadata, field: &'static str) -> Result<Metadata, ValidationError> {
    match body.remove(field) {
        None | Some(Value::Null) => Ok(Metadata::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ValidationError::invalid(field, "must be a JSON object")),
    }
}

/// The part of the winning rule reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSummary {
    /// Rule id
    pub id: RuleId,
    /// Lineage the rule belongs to
    pub lineage_id: LineageId,
    /// How the rule was created
    pub origin: RuleOrigin,
    /// Weight at decision time
    pub weight: f64,
    /// The pattern that matched
    pub pattern: Pattern,
}

impl From<&Rule> for RuleSummary {
    fn from(rule: &Rule) -> Self {
        Self {
            id: rule.id,
            lineage_id: rule.lineage_id,
            origin: rule.origin,
            weight: rule.weight,
            pattern: rule.pattern.clone(),
        }
    }
}

/// Result of a decide call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecideOutcome {
    /// Stored event
    pub event_id: EventId,
    /// Stored decision
    pub decision_id: DecisionId,
    /// Winning rule, if any matched
    pub rule: Option<RuleSummary>,
    /// Response to act on
    pub response: Value,
    /// Winner's weight, or the default confidence
    pub confidence: f64,
    /// Every matching rule, best first
    pub matched: Vec<RuleId>,
}

/// Response given when no store is reachable at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fallback {
    /// Default response
    pub response: Value,
    /// Default confidence
    pub confidence: f64,
    /// Why the fallback was used
    pub note: String,
}

/// Runs the decide flow:
/// ```text
/// load active rules → store event → select → record decision
/// ```
pub struct DecisionEngine {
    storage: Arc<dyn Storage>,
    selector: Box<dyn RuleSelector>,
    custom_selector: bool,
    recorder: DecisionRecorder,
    config: EngineConfig,
}

impl DecisionEngine {
    /// Create a new decision engine.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            recorder: DecisionRecorder::new(storage.clone()),
            storage,
            selector: Box::new(SelectorStrategy::default()),
            custom_selector: false,
            config: EngineConfig::default(),
        }
    }

    /// Set the configuration.
    ///
    /// The built-in weighted selector is rebuilt to honor `prefer_specific`.
    /// A selector installed with [`Self::with_selector`] is kept, whichever
    /// builder runs first.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        if !self.custom_selector {
            self.selector = Box::new(SelectorStrategy::Weighted(
                WeightedSelector::new().with_prefer_specific(config.prefer_specific),
            ));
        }
        self.recorder = DecisionRecorder::new(self.storage.clone()).with_config(config.recorder.clone());
        self.config = config;
        self
    }

    /// Set the rule selector.
    pub fn with_selector(mut self, selector: Box<dyn RuleSelector>) -> Self {
        self.selector = selector;
        self.custom_selector = true;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decide on one event and record the decision.
    pub async fn decide(&self, request: DecideRequest) -> Result<DecideOutcome, DecideError> {
        validate(&request)?;

        let rules = self.storage.get_active_rules().await?;
        debug!("Loaded {} active rules", rules.len());

        let pending = NewEvent::new(request.event_type, request.metadata, request.context);
        let event_id = self.storage.insert_event(&pending).await?;

        let candidates = self.selector.candidates(&rules, &pending.metadata);
        let winner = candidates.first().copied();
        for rule in &candidates {
            debug!("Rule {} matched event {} (weight {})", rule.id, event_id, rule.weight);
        }

        let decision = self.recorder.record(event_id, winner).await?;

        match winner {
            Some(rule) => info!(
                "Event {} ({}) decided by rule {} with confidence {}",
                event_id, pending.event_type, rule.id, decision.confidence
            ),
            None => info!(
                "Event {} ({}) matched no rule, using default response",
                event_id, pending.event_type
            ),
        }

        Ok(DecideOutcome {
            event_id,
            decision_id: decision.id,
            rule: winner.map(RuleSummary::from),
            response: decision.response,
            confidence: decision.confidence,
            matched: candidates.iter().map(|r| r.id).collect(),
        })
    }

    /// Store an event without deciding on it.
    pub async fn ingest(&self, request: DecideRequest) -> Result<Event, DecideError> {
        validate(&request)?;

        let pending = NewEvent::new(request.event_type, request.metadata, request.context)
            .with_source("ingest");
        let id = self.storage.insert_event(&pending).await?;
        info!("Ingested event {} ({})", id, pending.event_type);

        Ok(pending.into_event(id))
    }

    /// The answer to give when the engine could not be built at all.
    pub fn fallback(config: &RecorderConfig, note: impl Into<String>) -> Fallback {
        Fallback {
            response: config.default_response.clone(),
            confidence: config.default_confidence,
            note: note.into(),
        }
    }
}

fn validate(request: &DecideRequest) -> Result<(), ValidationError> {
    if request.event_type.trim().is_empty() {
        return Err(ValidationError::invalid("event_type", "must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_response;
    use crate::test_support::{BrokenStorage, ReadOnlyStorage};
    use genealogy_core::NewRule;
    use genealogy_storage::JsonStorage;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    async fn seeded() -> (tempfile::TempDir, Arc<JsonStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
        let rules = [
            (json!({}), json!({"mode": "observe"}), 0.5),
            (json!({"risk_level": {"gte": 8}}), json!({"mode": "block"}), 2.0),
            (json!({"risk_level": {"gte": 5}}), json!({"mode": "review"}), 1.0),
        ];
        for (pattern, response, weight) in rules {
            storage
                .insert_rule(&NewRule::new(Pattern::from_value(pattern).unwrap(), response, weight))
                .await
                .unwrap();
        }
        (dir, storage)
    }

    #[tokio::test]
    async fn test_decide_picks_heaviest_match() {
        let (_dir, storage) = seeded().await;
        let engine = DecisionEngine::new(storage.clone());

        let outcome = engine
            .decide(DecideRequest::new("message", meta(json!({"risk_level": 9}))))
            .await
            .unwrap();

        assert_eq!(outcome.response, json!({"mode": "block"}));
        assert_eq!(outcome.confidence, 2.0);
        assert_eq!(outcome.rule.as_ref().unwrap().id, RuleId(2));
        assert_eq!(outcome.matched, vec![RuleId(2), RuleId(3), RuleId(1)]);

        let decision = storage.get_decision(outcome.decision_id).await.unwrap().unwrap();
        assert_eq!(decision.event_id, outcome.event_id);
        assert_eq!(decision.rule_id, Some(RuleId(2)));

        let event = storage.get_event(outcome.event_id).await.unwrap().unwrap();
        assert_eq!(event.event_type, "message");
        assert_eq!(event.source, "decide");
    }

    #[tokio::test]
    async fn test_decide_without_match_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
        storage
            .insert_rule(&NewRule::new(
                Pattern::from_value(json!({"source": "site"})).unwrap(),
                json!({"mode": "block"}),
                1.0,
            ))
            .await
            .unwrap();

        let engine = DecisionEngine::new(storage.clone());
        let outcome = engine
            .decide(DecideRequest::new("message", meta(json!({"source": "email"}))))
            .await
            .unwrap();

        assert!(outcome.rule.is_none());
        assert!(outcome.matched.is_empty());
        assert_eq!(outcome.response, default_response());
        assert_eq!(outcome.confidence, 1.0);

        let decision = storage.get_decision(outcome.decision_id).await.unwrap().unwrap();
        assert_eq!(decision.rule_id, None);
    }

    #[tokio::test]
    async fn test_prefer_specific_config() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
        for pattern in [json!({}), json!({"source": "site"})] {
            storage
                .insert_rule(&NewRule::new(Pattern::from_value(pattern.clone()).unwrap(), pattern, 1.0))
                .await
                .unwrap();
        }

        let metadata = meta(json!({"source": "site"}));
        let plain = DecisionEngine::new(storage.clone());
        let outcome = plain.decide(DecideRequest::new("m", metadata.clone())).await.unwrap();
        assert_eq!(outcome.rule.unwrap().id, RuleId(1));

        let specific = DecisionEngine::new(storage).with_config(EngineConfig {
            prefer_specific: true,
            ..Default::default()
        });
        let outcome = specific.decide(DecideRequest::new("m", metadata)).await.unwrap();
        assert_eq!(outcome.rule.unwrap().id, RuleId(2));
    }

    /// Picks the lightest match.
    struct LightestSelector;

    impl RuleSelector for LightestSelector {
        fn select<'a>(&self, rules: &'a [Rule], metadata: &Metadata) -> Option<&'a Rule> {
            self.candidates(rules, metadata).into_iter().next()
        }

        fn candidates<'a>(&self, rules: &'a [Rule], metadata: &Metadata) -> Vec<&'a Rule> {
            let mut matched: Vec<&Rule> = rules
                .iter()
                .filter(|r| r.active && r.pattern.matches(metadata))
                .collect();
            matched.sort_by(|a, b| a.weight.total_cmp(&b.weight));
            matched
        }
    }

    #[tokio::test]
    async fn test_custom_selector_survives_config() {
        let (_dir, storage) = seeded().await;
        let metadata = meta(json!({"risk_level": 9}));
        let config = EngineConfig {
            prefer_specific: true,
            ..Default::default()
        };

        let selector_first = DecisionEngine::new(storage.clone())
            .with_selector(Box::new(LightestSelector))
            .with_config(config.clone());
        let outcome = selector_first.decide(DecideRequest::new("m", metadata.clone())).await.unwrap();
        assert_eq!(outcome.rule.unwrap().id, RuleId(1));

        let config_first = DecisionEngine::new(storage)
            .with_config(config)
            .with_selector(Box::new(LightestSelector));
        let outcome = config_first.decide(DecideRequest::new("m", metadata)).await.unwrap();
        assert_eq!(outcome.rule.unwrap().id, RuleId(1));
    }

    #[tokio::test]
    async fn test_ingest_stores_event_only() {
        let (_dir, storage) = seeded().await;
        let engine = DecisionEngine::new(storage.clone());

        let event = engine
            .ingest(DecideRequest::new("signup", meta(json!({"risk_level": 9}))))
            .await
            .unwrap();

        assert_eq!(event.source, "ingest");
        assert_eq!(storage.get_event(event.id).await.unwrap().unwrap(), event);
        let decisions = storage
            .get_decisions_by_rule_ids(&[RuleId(1), RuleId(2), RuleId(3)])
            .await
            .unwrap();
        assert!(decisions.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failures_surface() {
        let engine = DecisionEngine::new(Arc::new(BrokenStorage));
        let err = engine
            .decide(DecideRequest::new("message", Metadata::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DecideError::Storage(_)));

        // Decision write fails after the rules were read.
        let rule = NewRule::new(Pattern::empty(), json!({}), 1.0).into_rule(RuleId(1));
        let engine = DecisionEngine::new(Arc::new(ReadOnlyStorage { rules: vec![rule] }));
        let err = engine
            .decide(DecideRequest::new("message", Metadata::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DecideError::Storage(_)));
    }

    #[tokio::test]
    async fn test_empty_event_type_rejected() {
        let engine = DecisionEngine::new(Arc::new(BrokenStorage));
        let err = engine
            .decide(DecideRequest::new("  ", Metadata::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DecideError::Validation(_)));
    }

    #[test]
    fn test_request_from_json() {
        let request = DecideRequest::from_json(json!({
            "metadata": {"risk_level": 3},
            "context": {"user": "u1"}
        }))
        .unwrap();
        assert_eq!(request.event_type, "event");
        assert_eq!(request.metadata, meta(json!({"risk_level": 3})));
        assert_eq!(request.context, meta(json!({"user": "u1"})));

        let request = DecideRequest::from_json(json!({"event_type": "message"})).unwrap();
        assert_eq!(request.event_type, "message");
        assert!(request.metadata.is_empty());

        assert!(DecideRequest::from_json(json!([1, 2])).is_err());
        assert!(DecideRequest::from_json(json!({"metadata": [1]})).is_err());
        assert!(DecideRequest::from_json(json!({"context": "x"})).is_err());
        assert!(DecideRequest::from_json(json!({"event_type": ""})).is_err());
        assert!(DecideRequest::from_json(json!({"event_type": 5})).is_err());
    }

    #[test]
    fn test_fallback_uses_defaults() {
        let fallback = DecisionEngine::fallback(&RecorderConfig::default(), "no store configured");
        assert_eq!(fallback.response, default_response());
        assert_eq!(fallback.confidence, 1.0);
        assert_eq!(fallback.note, "no store configured");
    }
}
