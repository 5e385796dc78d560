//! Evolution layer - reshapes the rule registry from feedback statistics.
//!
//! A run retires rules whose success rate stays below the failure threshold
//! and clones the best performers into new rules of the same lineage.

#![warn(missing_docs, unused_crate_dependencies)]

mod optimizer;
mod metrics;

#[cfg(test)]
mod test_support;

pub use optimizer::{
    plan, EvolutionConfig, EvolutionEngine, EvolutionError, EvolutionFailure, EvolutionReport,
    EvolutionSummary, Plan, Promotion,
};
pub use metrics::{aggregate, RuleStats};
