//! Genealogy core data models.
//!
//! This crate defines the rule registry ("genes"), the append-only event,
//! decision and feedback records, and the pure predicate engine that decides
//! whether a rule's pattern matches an event's metadata.

#![warn(missing_docs)]

// Core identities
mod id;

// Registry
mod pattern;
mod rule;

// Append-only history
mod event;
mod decision;
mod feedback;

mod error;

// Re-exports
pub use id::*;

pub use pattern::{Clause, FieldRule, Operator, Pattern};
pub use rule::{clamp_weight, NewRule, Provenance, Rule, RuleOrigin, DEFAULT_RULE_TYPE};
pub use event::{Event, NewEvent};
pub use decision::{Decision, NewDecision};
pub use feedback::{verdict_of, Feedback, NewFeedback, Outcome, Verdict};
pub use error::ValidationError;

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

/// Event metadata: field name to arbitrary JSON value.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
