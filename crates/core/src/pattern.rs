//! Pattern model - the predicate language rules use to gate on metadata.
//!
//! A pattern maps metadata field names to either a plain value (equality
//! shorthand) or an object of `operator -> expected value` clauses:
//!
//! ```text
//! { "risk_level": { "gte": 8 }, "source": { "in": ["whatsapp", "site"] }, "lang": "pt" }
//! ```
//!
//! Every field and every clause must hold. The empty pattern `{}` matches any
//! metadata and is how default rules are written. A field whose clause object
//! is empty (`{"x": {}}`) puts no constraint on that field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Metadata, ValidationError};

/// Comparison operator inside a field's clause object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Strict equality
    Eq,
    /// Strict inequality
    Neq,
    /// Numeric greater-than
    Gt,
    /// Numeric greater-or-equal
    Gte,
    /// Numeric less-than
    Lt,
    /// Numeric less-or-equal
    Lte,
    /// Membership of the actual value in the expected array
    In,
    /// Substring (string actual) or element (array actual) containment
    Contains,
    /// Presence (truthy expected) or absence (falsy expected) of the field
    Exists,
    /// Unrecognized operator name; never matches
    Unknown(String),
}

impl Operator {
    /// Parse an operator key. Unrecognized names are kept, not rejected.
    pub fn parse(name: &str) -> Self {
        match name {
            "eq" => Self::Eq,
            "neq" => Self::Neq,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "in" => Self::In,
            "contains" => Self::Contains,
            "exists" => Self::Exists,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Operator key as written in patterns.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Contains => "contains",
            Self::Exists => "exists",
            Self::Unknown(name) => name,
        }
    }
}

/// One `operator: expected` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// Operator
    pub op: Operator,
    /// Expected value, as written in the pattern
    pub expected: Value,
}

impl Clause {
    /// Evaluate against the field's actual value (`None` when the field is
    /// missing from the metadata).
    pub fn holds(&self, actual: Option<&Value>) -> bool {
        match &self.op {
            Operator::Eq => actual.is_some_and(|a| strict_eq(a, &self.expected)),
            Operator::Neq => !actual.is_some_and(|a| strict_eq(a, &self.expected)),
            Operator::Gt => compare_numbers(actual, &self.expected, |a, e| a > e),
            Operator::Gte => compare_numbers(actual, &self.expected, |a, e| a >= e),
            Operator::Lt => compare_numbers(actual, &self.expected, |a, e| a < e),
            Operator::Lte => compare_numbers(actual, &self.expected, |a, e| a <= e),
            Operator::In => match (actual, &self.expected) {
                (Some(a), Value::Array(items)) => items.iter().any(|item| strict_eq(a, item)),
                _ => false,
            },
            Operator::Contains => match actual {
                Some(Value::String(haystack)) => {
                    needle_text(&self.expected).is_some_and(|needle| haystack.contains(&needle))
                }
                Some(Value::Array(items)) => items.iter().any(|item| strict_eq(item, &self.expected)),
                _ => false,
            },
            Operator::Exists => {
                let present = actual.is_some_and(|a| !a.is_null());
                if truthy(&self.expected) {
                    present
                } else {
                    !present
                }
            }
            Operator::Unknown(_) => false,
        }
    }
}

/// The predicate attached to one metadata field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    /// `"field": value` shorthand for `{"eq": value}`
    Equals(Value),
    /// `"field": {op: expected, ...}`, all clauses must hold
    Clauses(Vec<Clause>),
}

impl FieldRule {
    fn parse(spec: &Value) -> Self {
        match spec {
            Value::Object(ops) => Self::Clauses(
                ops.iter()
                    .map(|(op, expected)| Clause {
                        op: Operator::parse(op),
                        expected: expected.clone(),
                    })
                    .collect(),
            ),
            other => Self::Equals(other.clone()),
        }
    }

    /// Evaluate against the field's actual value.
    pub fn holds(&self, actual: Option<&Value>) -> bool {
        match self {
            Self::Equals(expected) => actual.is_some_and(|a| strict_eq(a, expected)),
            Self::Clauses(clauses) => clauses.iter().all(|c| c.holds(actual)),
        }
    }

    fn clause_count(&self) -> usize {
        match self {
            Self::Equals(_) => 1,
            Self::Clauses(clauses) => clauses.len(),
        }
    }
}

/// A conjunctive predicate over event metadata.
///
/// Keeps the JSON it was built from so it is stored and returned verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Pattern {
    raw: Map<String, Value>,
    fields: Vec<(String, FieldRule)>,
}

impl Pattern {
    /// The empty pattern, matching everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a JSON value; anything but an object is rejected.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Ok(Self::from(map)),
            other => Err(ValidationError::invalid(
                "pattern",
                format!("expected a JSON object, got {}", type_name(&other)),
            )),
        }
    }

    /// Whether every field predicate holds for `metadata`.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.fields
            .iter()
            .all(|(field, rule)| rule.holds(metadata.get(field)))
    }

    /// True for `{}`, the default/fallback pattern.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of clauses across all fields; shorthand equality counts as one.
    pub fn specificity(&self) -> usize {
        self.fields.iter().map(|(_, rule)| rule.clause_count()).sum()
    }

    /// Parsed field predicates.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.fields.iter().map(|(name, rule)| (name.as_str(), rule))
    }

    /// The JSON object this pattern was built from.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.raw
    }
}

impl From<Map<String, Value>> for Pattern {
    fn from(raw: Map<String, Value>) -> Self {
        let fields = raw
            .iter()
            .map(|(name, spec)| (name.clone(), FieldRule::parse(spec)))
            .collect();
        Self { raw, fields }
    }
}

impl From<Pattern> for Map<String, Value> {
    fn from(pattern: Pattern) -> Self {
        pattern.raw
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Strict equality: numbers by value, containers structurally.
fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| strict_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| strict_eq(x, y)))
        }
        _ => a == b,
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(Value::as_f64), expected.as_f64()) {
        (Some(a), Some(e)) => cmp(a, e),
        _ => false,
    }
}

/// String form of a scalar for substring search.
fn needle_text(expected: &Value) -> Option<String> {
    match expected {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(f.to_string())
                }
            }
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
