//! Per-rule feedback statistics.

use std::collections::HashMap;

use genealogy_core::{Decision, DecisionId, Feedback, Rule, RuleId, Verdict};
use serde::{Deserialize, Serialize};

/// Feedback tallies for one rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    /// Rule the tallies belong to
    pub rule_id: RuleId,
    /// Feedback items on decisions the rule won
    pub samples: u64,
    /// Items with a positive verdict
    pub success: u64,
    /// Items with a negative verdict
    pub fail: u64,
}

impl RuleStats {
    /// Empty tallies for `rule_id`.
    pub fn new(rule_id: RuleId) -> Self {
        Self {
            rule_id,
            samples: 0,
            success: 0,
            fail: 0,
        }
    }

    /// `success / samples`; `None` with no samples.
    pub fn success_rate(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.success as f64 / self.samples as f64)
    }

    fn count(&mut self, verdict: Option<Verdict>) {
        self.samples += 1;
        match verdict {
            Some(Verdict::Positive) => self.success += 1,
            Some(Verdict::Negative) => self.fail += 1,
            None => {}
        }
    }
}

/// Tally feedback per rule.
///
/// Every rule in `rules` gets an entry, even with zero samples. Decisions
/// for other rules and feedback on unknown decisions are ignored.
pub fn aggregate(rules: &[Rule], decisions: &[Decision], feedback: &[Feedback]) -> HashMap<RuleId, RuleStats> {
    let mut stats: HashMap<RuleId, RuleStats> =
        rules.iter().map(|r| (r.id, RuleStats::new(r.id))).collect();

    let owner: HashMap<DecisionId, RuleId> = decisions
        .iter()
        .filter_map(|d| d.rule_id.map(|rule_id| (d.id, rule_id)))
        .collect();

    for item in feedback {
        let Some(rule_id) = owner.get(&item.decision_id) else {
            continue;
        };
        if let Some(entry) = stats.get_mut(rule_id) {
            entry.count(item.verdict());
        }
    }

    stats
}
