//! Rule model - weighted, pattern-gated entries of the gene registry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{LineageId, RuleId};
use crate::{Metadata, Pattern, Time};

/// Rule type given to rules created without one.
pub const DEFAULT_RULE_TYPE: &str = "pattern";

/// How a rule entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    /// Bootstrapped default rule
    Seed,
    /// Added by an operator
    Operator,
    /// Cloned from a parent by an evolution run
    Evolution,
}

impl RuleOrigin {
    /// Lowercase name used in storage and output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Operator => "operator",
            Self::Evolution => "evolution",
        }
    }
}

impl std::str::FromStr for RuleOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seed" => Ok(Self::Seed),
            "operator" => Ok(Self::Operator),
            "evolution" => Ok(Self::Evolution),
            other => Err(format!("unknown rule origin: {}", other)),
        }
    }
}

/// Where an evolved rule came from. Informational only; never read by matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Rule this one was cloned from
    pub evolved_from: RuleId,
    /// When the clone was made
    pub at: Time,
    /// Parent's feedback sample count at clone time
    pub parent_samples: u64,
    /// Parent's success rate at clone time
    pub parent_success_rate: f64,
    /// Free-form note
    pub note: String,
}

/// A stored rule ("gene").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier, assigned by the store
    pub id: RuleId,

    /// Shared with every ancestor and descendant
    pub lineage_id: LineageId,

    /// Rule this one was cloned from
    pub parent_id: Option<RuleId>,

    /// Classification label, inherited by children
    pub rule_type: String,

    /// How the rule was created
    pub origin: RuleOrigin,

    /// Predicate over event metadata
    pub pattern: Pattern,

    /// Payload returned verbatim when this rule wins
    pub response: Value,

    /// Confidence / priority, never negative
    pub weight: f64,

    /// Eligible for matching
    pub active: bool,

    /// Set on evolved rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,

    /// When the rule was inserted
    pub created_at: Time,
}

impl Rule {
    /// Whether this rule is active and its pattern matches.
    pub fn applies_to(&self, metadata: &Metadata) -> bool {
        self.active && self.pattern.matches(metadata)
    }

    /// Prepare a child with the same lineage, pattern, type and response.
    pub fn spawn_child(&self, weight: f64, provenance: Provenance) -> NewRule {
        NewRule {
            lineage_id: self.lineage_id,
            parent_id: Some(self.id),
            rule_type: self.rule_type.clone(),
            origin: RuleOrigin::Evolution,
            pattern: self.pattern.clone(),
            response: self.response.clone(),
            weight: clamp_weight(weight),
            active: true,
            provenance: Some(provenance),
            created_at: chrono::Utc::now(),
        }
    }
}

/// A rule not yet inserted; the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    /// Lineage to join (a fresh one for root rules)
    pub lineage_id: LineageId,
    /// Parent rule, if cloned
    pub parent_id: Option<RuleId>,
    /// Classification label
    pub rule_type: String,
    /// How the rule was created
    pub origin: RuleOrigin,
    /// Predicate over event metadata
    pub pattern: Pattern,
    /// Payload returned when this rule wins
    pub response: Value,
    /// Initial weight
    pub weight: f64,
    /// Initially active
    pub active: bool,
    /// Set on evolved rules
    pub provenance: Option<Provenance>,
    /// Creation time
    pub created_at: Time,
}

impl NewRule {
    /// A root rule starting a new lineage.
    pub fn new(pattern: Pattern, response: Value, weight: f64) -> Self {
        Self {
            lineage_id: LineageId::new(),
            parent_id: None,
            rule_type: DEFAULT_RULE_TYPE.to_string(),
            origin: RuleOrigin::Operator,
            pattern,
            response,
            weight: clamp_weight(weight),
            active: true,
            provenance: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Set the rule type.
    pub fn with_rule_type(mut self, rule_type: impl Into<String>) -> Self {
        self.rule_type = rule_type.into();
        self
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: RuleOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Attach the id the store assigned.
    pub fn into_rule(self, id: RuleId) -> Rule {
        Rule {
            id,
            lineage_id: self.lineage_id,
            parent_id: self.parent_id,
            rule_type: self.rule_type,
            origin: self.origin,
            pattern: self.pattern,
            response: self.response,
            weight: self.weight,
            active: self.active,
            provenance: self.provenance,
            created_at: self.created_at,
        }
    }
}

/// Clamp a weight into the valid range; NaN collapses to zero.
pub fn clamp_weight(weight: f64) -> f64 {
    if weight.is_nan() {
        0.0
    } else {
        weight.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provenance(parent: RuleId) -> Provenance {
        Provenance {
            evolved_from: parent,
            at: chrono::Utc::now(),
            parent_samples: 5,
            parent_success_rate: 0.9,
            note: "test".to_string(),
        }
    }

    #[test]
    fn test_new_rule_clamps_weight() {
        let rule = NewRule::new(Pattern::empty(), json!({"mode": "allow"}), -3.0);
        assert_eq!(rule.weight, 0.0);
        assert_eq!(rule.rule_type, DEFAULT_RULE_TYPE);
        assert!(rule.parent_id.is_none());
    }

    #[test]
    fn test_spawn_child_keeps_lineage_and_pattern() {
        let pattern = Pattern::from_value(json!({"risk_level": {"gte": 8}})).unwrap();
        let parent = NewRule::new(pattern.clone(), json!({"mode": "block"}), 2.0)
            .with_rule_type("risk")
            .into_rule(RuleId(3));

        let child = parent.spawn_child(2.15, provenance(parent.id));
        assert_eq!(child.lineage_id, parent.lineage_id);
        assert_eq!(child.parent_id, Some(RuleId(3)));
        assert_eq!(child.pattern, pattern);
        assert_eq!(child.response, parent.response);
        assert_eq!(child.rule_type, "risk");
        assert_eq!(child.origin, RuleOrigin::Evolution);
        assert!(child.active);
    }

    #[test]
    fn test_inactive_rule_never_applies() {
        let mut rule = NewRule::new(Pattern::empty(), json!({}), 1.0).into_rule(RuleId(1));
        assert!(rule.applies_to(&Metadata::new()));
        rule.active = false;
        assert!(!rule.applies_to(&Metadata::new()));
    }

    #[test]
    fn test_origin_parse() {
        assert_eq!("evolution".parse::<RuleOrigin>().unwrap(), RuleOrigin::Evolution);
        assert!("mutant".parse::<RuleOrigin>().is_err());
    }
}
