//! Rule selection strategies.

use std::cmp::Ordering;

use genealogy_core::{Metadata, Rule};

/// Specificity above this many clauses earns no further preference.
pub const SPECIFICITY_CAP: usize = 8;

/// Strategy for picking the winning rule for an event.
///
/// Selection is pure: no I/O, and the result does not depend on the order of
/// `rules`.
pub trait RuleSelector: Send + Sync {
    /// Pick the best active rule whose pattern matches `metadata`.
    fn select<'a>(&self, rules: &'a [Rule], metadata: &Metadata) -> Option<&'a Rule>;

    /// Every active rule whose pattern matches, best first.
    fn candidates<'a>(&self, rules: &'a [Rule], metadata: &Metadata) -> Vec<&'a Rule>;
}

/// Highest weight wins; ties go to the lowest id.
///
/// With `prefer_specific`, pattern specificity breaks exact weight ties
/// before the id does. It is a separate sort key, so no weight difference
/// can ever be overridden by it.
#[derive(Debug, Clone, Default)]
pub struct WeightedSelector {
    prefer_specific: bool,
}

impl WeightedSelector {
    /// Create a new weighted selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the specificity tie-breaker.
    pub fn with_prefer_specific(mut self, prefer_specific: bool) -> Self {
        self.prefer_specific = prefer_specific;
        self
    }

    /// `Less` means `a` ranks ahead of `b`.
    fn rank(&self, a: &Rule, b: &Rule) -> Ordering {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                if self.prefer_specific {
                    specificity(b).cmp(&specificity(a))
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| a.id.cmp(&b.id))
    }
}

fn specificity(rule: &Rule) -> usize {
    rule.pattern.specificity().min(SPECIFICITY_CAP)
}

impl RuleSelector for WeightedSelector {
    fn select<'a>(&self, rules: &'a [Rule], metadata: &Metadata) -> Option<&'a Rule> {
        rules
            .iter()
            .filter(|r| r.applies_to(metadata))
            .min_by(|a, b| self.rank(a, b))
    }

    fn candidates<'a>(&self, rules: &'a [Rule], metadata: &Metadata) -> Vec<&'a Rule> {
        let mut matching: Vec<&Rule> = rules.iter().filter(|r| r.applies_to(metadata)).collect();
        matching.sort_by(|a, b| self.rank(a, b));
        matching
    }
}

/// Selector strategies available.
pub enum SelectorStrategy {
    /// Weight-ordered selector
    Weighted(WeightedSelector),
}

impl Default for SelectorStrategy {
    fn default() -> Self {
        Self::Weighted(WeightedSelector::default())
    }
}

impl RuleSelector for SelectorStrategy {
    fn select<'a>(&self, rules: &'a [Rule], metadata: &Metadata) -> Option<&'a Rule> {
        match self {
            Self::Weighted(s) => s.select(rules, metadata),
        }
    }

    fn candidates<'a>(&self, rules: &'a [Rule], metadata: &Metadata) -> Vec<&'a Rule> {
        match self {
            Self::Weighted(s) => s.candidates(rules, metadata),
        }
    }
}
