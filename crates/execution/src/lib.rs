//! Execution layer - rule selection, decision recording, and the decide flow.

#![warn(missing_docs)]

pub mod selector;
pub mod recorder;
pub mod engine;

pub use selector::{RuleSelector, SelectorStrategy, WeightedSelector, SPECIFICITY_CAP};
pub use recorder::{default_response, DecisionRecorder, RecorderConfig};
pub use engine::{
    DecideError, DecideOutcome, DecideRequest, DecisionEngine, EngineConfig, Fallback, RuleSummary,
};

#[cfg(test)]
mod test_support;
