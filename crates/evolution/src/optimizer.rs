//! Evolution engine - retires failing rules and clones successful ones.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use genealogy_core::{LineageId, Provenance, Rule, RuleId};
use genealogy_storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::metrics::{aggregate, RuleStats};

/// Store-wide lease serializing runs across processes.
const RUN_LEASE: &str = "evolution";
/// A run holding the lease longer than this is presumed dead.
const LEASE_TTL: Duration = Duration::from_secs(600);
const LEASE_POLL: Duration = Duration::from_millis(50);
const LEASE_WAIT: Duration = Duration::from_secs(60);

/// Errors raised by [`EvolutionEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    /// Thresholds are out of range
    #[error("invalid evolution config: {0}")]
    InvalidConfig(String),

    /// Rule lookup failed
    #[error("rule not found: {0}")]
    RuleNotFound(RuleId),

    /// Another run kept the store's evolution lease past the wait limit
    #[error("another evolution run is in progress")]
    Busy,

    /// A read against the store failed; nothing was changed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Thresholds for an evolution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Rules with fewer feedback samples are left alone
    pub min_samples: u64,
    /// Success rate below which a rule is retired
    pub fail_threshold: f64,
    /// How many of the best rules are cloned per run
    pub promote_top_n: usize,
    /// Weight added to a clone over its parent
    pub mutation_delta: f64,
    /// Upper bound on a clone's weight
    pub weight_cap: f64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            fail_threshold: 0.2,
            promote_top_n: 1,
            mutation_delta: 0.15,
            weight_cap: 50.0,
        }
    }
}

impl EvolutionConfig {
    /// Reject thresholds that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), EvolutionError> {
        if self.min_samples == 0 {
            return Err(EvolutionError::InvalidConfig("min_samples must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.fail_threshold) {
            return Err(EvolutionError::InvalidConfig(format!(
                "fail_threshold must be within [0, 1], got {}",
                self.fail_threshold
            )));
        }
        if !self.mutation_delta.is_finite() {
            return Err(EvolutionError::InvalidConfig("mutation_delta must be finite".into()));
        }
        if !self.weight_cap.is_finite() || self.weight_cap < 0.0 {
            return Err(EvolutionError::InvalidConfig(format!(
                "weight_cap must be a non-negative number, got {}",
                self.weight_cap
            )));
        }
        Ok(())
    }
}

/// A rule chosen for cloning.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    /// Parent to clone
    pub parent: RuleId,
    /// Parent's statistics at planning time
    pub stats: RuleStats,
}

/// What a run intends to change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Rules to retire, ascending id
    pub deactivate: Vec<RuleId>,
    /// Rules to clone, best first
    pub promote: Vec<Promotion>,
}

/// Decide which rules to retire and which to clone.
///
/// `promoted_at` maps a parent to the largest sample count recorded on any
/// of its existing children; a parent whose current samples do not exceed
/// that count has already been cloned on these statistics and is skipped.
pub fn plan(
    rules: &[Rule],
    stats: &HashMap<RuleId, RuleStats>,
    promoted_at: &HashMap<RuleId, u64>,
    config: &EvolutionConfig,
) -> Plan {
    let mut deactivate = Vec::new();
    let mut ranked: Vec<(RuleStats, f64)> = Vec::new();

    for rule in rules.iter().filter(|r| r.active) {
        let Some(s) = stats.get(&rule.id) else {
            continue;
        };
        if s.samples < config.min_samples {
            continue;
        }
        let Some(rate) = s.success_rate() else {
            continue;
        };
        if rate < config.fail_threshold {
            deactivate.push(rule.id);
        } else {
            ranked.push((*s, rate));
        }
    }

    deactivate.sort();
    ranked.sort_by(|(a, ra), (b, rb)| {
        rb.partial_cmp(ra)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.samples.cmp(&a.samples))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });

    let promote = ranked
        .into_iter()
        .take(config.promote_top_n)
        .filter(|(s, _)| promoted_at.get(&s.rule_id).map_or(true, |&seen| s.samples > seen))
        .map(|(s, _)| Promotion {
            parent: s.rule_id,
            stats: s,
        })
        .collect();

    Plan { deactivate, promote }
}

/// Totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionSummary {
    /// Active rules when the run started
    pub active_rules_before: usize,
    /// Rules retired
    pub deactivated: usize,
    /// Rules created
    pub created: usize,
}

/// A mutation that did not go through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionFailure {
    /// Rule the mutation was about
    pub rule_id: RuleId,
    /// What went wrong
    pub error: String,
}

/// Result of an evolution run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionReport {
    /// Totals
    pub summary: EvolutionSummary,
    /// Rules retired
    pub deactivated: Vec<RuleId>,
    /// Children created
    pub created: Vec<Rule>,
    /// Mutations that failed
    pub failures: Vec<EvolutionFailure>,
}

/// Periodically reshapes the registry from feedback statistics.
pub struct EvolutionEngine {
    storage: Arc<dyn Storage>,
    config: EvolutionConfig,
    run_lock: Mutex<()>,
    holder: String,
    lease_wait: Duration,
}

impl EvolutionEngine {
    /// Create a new evolution engine.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            config: EvolutionConfig::default(),
            run_lock: Mutex::new(()),
            holder: format!("{}-{}", std::process::id(), ulid::Ulid::new()),
            lease_wait: LEASE_WAIT,
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EvolutionConfig) -> Self {
        self.config = config;
        self
    }

    /// How long a run waits for another process's run to finish.
    pub fn with_lease_wait(mut self, wait: Duration) -> Self {
        self.lease_wait = wait;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Current statistics for every active rule.
    pub async fn stats(&self) -> Result<Vec<RuleStats>, EvolutionError> {
        let rules = self.storage.get_active_rules().await?;
        let stats = self.collect_stats(&rules).await?;
        let mut stats: Vec<RuleStats> = stats.into_values().collect();
        stats.sort_by_key(|s| s.rule_id);
        Ok(stats)
    }

    async fn collect_stats(&self, rules: &[Rule]) -> Result<HashMap<RuleId, RuleStats>, StorageError> {
        let rule_ids: Vec<RuleId> = rules.iter().map(|r| r.id).collect();
        let decisions = self.storage.get_decisions_by_rule_ids(&rule_ids).await?;
        let decision_ids: Vec<_> = decisions.iter().map(|d| d.id).collect();
        let feedback = self.storage.get_feedback_by_decision_ids(&decision_ids).await?;
        debug!(
            "Aggregating {} feedback items over {} decisions",
            feedback.len(),
            decisions.len()
        );
        Ok(aggregate(rules, &decisions, &feedback))
    }

    /// Largest parent sample count recorded by existing children, per parent.
    async fn promotion_watermarks(
        &self,
        rules: &[Rule],
        stats: &HashMap<RuleId, RuleStats>,
    ) -> Result<HashMap<RuleId, u64>, StorageError> {
        let lineages: HashSet<LineageId> = rules
            .iter()
            .filter(|r| stats.get(&r.id).is_some_and(|s| s.samples >= self.config.min_samples))
            .map(|r| r.lineage_id)
            .collect();

        let mut marks: HashMap<RuleId, u64> = HashMap::new();
        for lineage in lineages {
            for member in self.storage.get_rules_by_lineage(lineage).await? {
                let (Some(parent), Some(provenance)) = (member.parent_id, member.provenance) else {
                    continue;
                };
                let mark = marks.entry(parent).or_insert(0);
                *mark = (*mark).max(provenance.parent_samples);
            }
        }
        Ok(marks)
    }

    /// Run one evolution pass.
    ///
    /// Runs are serialized within this engine and, through a lease in the
    /// store, across every engine sharing the store. Read failures abort
    /// before anything changes. Failed mutations are listed in the report
    /// and the rest of the run proceeds.
    pub async fn evolve(&self) -> Result<EvolutionReport, EvolutionError> {
        self.config.validate()?;
        let _guard = self.run_lock.lock().await;

        self.acquire_lease().await?;
        let result = self.run_once().await;
        if let Err(e) = self.storage.release_lease(RUN_LEASE, &self.holder).await {
            warn!("Failed to release the evolution lease: {}", e);
        }
        result
    }

    async fn acquire_lease(&self) -> Result<(), EvolutionError> {
        let deadline = tokio::time::Instant::now() + self.lease_wait;
        loop {
            if self
                .storage
                .try_acquire_lease(RUN_LEASE, &self.holder, LEASE_TTL)
                .await?
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EvolutionError::Busy);
            }
            debug!("Evolution lease held elsewhere, waiting");
            tokio::time::sleep(LEASE_POLL).await;
        }
    }

    async fn run_once(&self) -> Result<EvolutionReport, EvolutionError> {
        let rules = self.storage.get_active_rules().await?;
        let stats = self.collect_stats(&rules).await?;
        let marks = self.promotion_watermarks(&rules, &stats).await?;
        let plan = plan(&rules, &stats, &marks, &self.config);

        info!(
            "Evolution run over {} active rules: {} to retire, {} to promote",
            rules.len(),
            plan.deactivate.len(),
            plan.promote.len()
        );

        let mut report = EvolutionReport::default();
        report.summary.active_rules_before = rules.len();
        self.retire(&plan.deactivate, &mut report).await;

        let by_id: HashMap<RuleId, &Rule> = rules.iter().map(|r| (r.id, r)).collect();
        for promotion in &plan.promote {
            let Some(parent) = by_id.get(&promotion.parent) else {
                continue;
            };
            let rate = promotion.stats.success_rate().unwrap_or(0.0);
            let provenance = Provenance {
                evolved_from: parent.id,
                at: chrono::Utc::now(),
                parent_samples: promotion.stats.samples,
                parent_success_rate: rate,
                note: format!(
                    "promoted at success rate {:.3} over {} samples",
                    rate, promotion.stats.samples
                ),
            };
            let weight = (parent.weight + self.config.mutation_delta).min(self.config.weight_cap);

            match self.storage.insert_rule(&parent.spawn_child(weight, provenance)).await {
                Ok(child) => {
                    info!("Rule {} cloned into rule {} (weight {})", parent.id, child.id, child.weight);
                    report.created.push(child);
                }
                Err(e) => {
                    warn!("Failed to clone rule {}: {}", parent.id, e);
                    report.failures.push(EvolutionFailure {
                        rule_id: parent.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.summary.created = report.created.len();
        info!(
            "Evolution run finished: {} retired, {} created, {} failures",
            report.summary.deactivated,
            report.summary.created,
            report.failures.len()
        );

        Ok(report)
    }

    /// Deactivate `ids`, reporting only rules this run actually retired.
    ///
    /// Rules switched off since the run read them are skipped.
    async fn retire(&self, ids: &[RuleId], report: &mut EvolutionReport) {
        let mut still_active = Vec::with_capacity(ids.len());
        for &rule_id in ids {
            match self.storage.get_rule(rule_id).await {
                Ok(Some(rule)) if rule.active => still_active.push(rule_id),
                Ok(_) => debug!("Rule {} already inactive, not retiring it", rule_id),
                Err(e) => report.failures.push(EvolutionFailure {
                    rule_id,
                    error: e.to_string(),
                }),
            }
        }
        if still_active.is_empty() {
            return;
        }

        match self.storage.deactivate_rules(&still_active).await {
            Ok(count) => {
                debug!("Deactivated {} rules", count);
                if (count as usize) < still_active.len() {
                    warn!(
                        "Planned to retire {} rules but only {} were still active",
                        still_active.len(),
                        count
                    );
                }
                report.summary.deactivated = count as usize;
                report.deactivated = still_active;
            }
            Err(e) => {
                warn!("Failed to deactivate {} rules: {}", still_active.len(), e);
                report.failures.extend(still_active.iter().map(|&rule_id| EvolutionFailure {
                    rule_id,
                    error: e.to_string(),
                }));
            }
        }
    }

    /// Evolve every `period` until `shutdown` turns true or its sender goes
    /// away. Failed runs are logged and the loop continues.
    pub async fn run_periodic(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Evolution runner started, period {:?}", period);
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.evolve().await {
                        error!("Evolution run failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Evolution runner stopped");
    }

    /// The rule and its ancestors, nearest first.
    pub async fn lineage(&self, rule_id: RuleId) -> Result<Vec<Rule>, EvolutionError> {
        let mut current = self
            .storage
            .get_rule(rule_id)
            .await?
            .ok_or(EvolutionError::RuleNotFound(rule_id))?;

        let mut seen = HashSet::from([current.id]);
        let mut chain = Vec::new();
        while let Some(parent_id) = current.parent_id {
            let parent = match self.storage.get_rule(parent_id).await? {
                Some(parent) if seen.insert(parent.id) => parent,
                _ => break,
            };
            chain.push(std::mem::replace(&mut current, parent));
        }
        chain.push(current);

        Ok(chain)
    }

    /// Every rule sharing `lineage_id`, ascending id.
    pub async fn lineage_members(&self, lineage_id: LineageId) -> Result<Vec<Rule>, EvolutionError> {
        let mut members = self.storage.get_rules_by_lineage(lineage_id).await?;
        members.sort_by_key(|r| r.id);
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FlakyStorage;
    use genealogy_core::{NewDecision, NewEvent, NewFeedback, NewRule, Outcome, Pattern, RuleOrigin};
    use genealogy_storage::JsonStorage;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, Arc<JsonStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
        (dir, storage)
    }

    async fn add_rule(storage: &dyn Storage, weight: f64) -> Rule {
        storage
            .insert_rule(&NewRule::new(Pattern::empty(), json!({"w": weight}), weight))
            .await
            .unwrap()
    }

    /// Record one decision for `rule` and `successes` + `failures` feedback items on it.
    async fn judge(storage: &dyn Storage, rule: &Rule, successes: usize, failures: usize) {
        let event_id = storage
            .insert_event(&NewEvent::new("message", Default::default(), Default::default()))
            .await
            .unwrap();
        let decision_id = storage
            .insert_decision(&NewDecision {
                event_id,
                rule_id: Some(rule.id),
                response: rule.response.clone(),
                confidence: rule.weight,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let outcomes = std::iter::repeat(Outcome::Success)
            .take(successes)
            .chain(std::iter::repeat(Outcome::Fail).take(failures));
        for outcome in outcomes {
            storage
                .insert_feedback(&NewFeedback::new(decision_id, outcome, None))
                .await
                .unwrap();
        }
    }

    fn stats(id: i64, samples: u64, success: u64) -> RuleStats {
        RuleStats {
            rule_id: RuleId(id),
            samples,
            success,
            fail: samples - success,
        }
    }

    fn rules(ids: &[i64]) -> Vec<Rule> {
        ids.iter()
            .map(|&id| NewRule::new(Pattern::empty(), json!({}), 1.0).into_rule(RuleId(id)))
            .collect()
    }

    #[test]
    fn test_plan_gates_on_min_samples() {
        let rules = rules(&[1, 2]);
        let stats = HashMap::from([(RuleId(1), stats(1, 4, 0)), (RuleId(2), stats(2, 4, 4))]);

        let plan = plan(&rules, &stats, &HashMap::new(), &EvolutionConfig::default());
        assert_eq!(plan, Plan::default());
    }

    #[test]
    fn test_plan_ranks_promotions() {
        let rules = rules(&[1, 2, 3, 4]);
        let stats = HashMap::from([
            (RuleId(1), stats(1, 10, 8)),
            (RuleId(2), stats(2, 20, 16)),
            (RuleId(3), stats(3, 10, 9)),
            (RuleId(4), stats(4, 10, 1)),
        ]);
        let config = EvolutionConfig {
            promote_top_n: 3,
            ..Default::default()
        };

        let plan = plan(&rules, &stats, &HashMap::new(), &config);
        assert_eq!(plan.deactivate, vec![RuleId(4)]);
        let order: Vec<_> = plan.promote.iter().map(|p| p.parent).collect();
        // Higher rate first, then more samples, then lower id.
        assert_eq!(order, vec![RuleId(3), RuleId(2), RuleId(1)]);
    }

    #[test]
    fn test_plan_never_promotes_a_retired_rule() {
        let rules = rules(&[1]);
        let stats = HashMap::from([(RuleId(1), stats(1, 10, 4))]);
        let config = EvolutionConfig {
            fail_threshold: 0.5,
            ..Default::default()
        };

        let plan = plan(&rules, &stats, &HashMap::new(), &config);
        assert_eq!(plan.deactivate, vec![RuleId(1)]);
        assert!(plan.promote.is_empty());
    }

    #[test]
    fn test_plan_skips_already_promoted_parent() {
        let rules = rules(&[1, 2]);
        let stats = HashMap::from([(RuleId(1), stats(1, 10, 9)), (RuleId(2), stats(2, 10, 8))]);

        let plan_now = plan(&rules, &stats, &HashMap::from([(RuleId(1), 10)]), &EvolutionConfig::default());
        // The best rule was cloned on these numbers; the runner-up is not promoted in its place.
        assert!(plan_now.promote.is_empty());

        let plan_later = plan(&rules, &stats, &HashMap::from([(RuleId(1), 9)]), &EvolutionConfig::default());
        assert_eq!(plan_later.promote.len(), 1);
        assert_eq!(plan_later.promote[0].parent, RuleId(1));
    }

    #[test]
    fn test_config_validation() {
        assert!(EvolutionConfig::default().validate().is_ok());
        for bad in [
            EvolutionConfig { min_samples: 0, ..Default::default() },
            EvolutionConfig { fail_threshold: 1.5, ..Default::default() },
            EvolutionConfig { fail_threshold: f64::NAN, ..Default::default() },
            EvolutionConfig { mutation_delta: f64::INFINITY, ..Default::default() },
            EvolutionConfig { weight_cap: -1.0, ..Default::default() },
        ] {
            assert!(matches!(bad.validate(), Err(EvolutionError::InvalidConfig(_))));
        }
    }

    #[tokio::test]
    async fn test_evolve_retires_and_promotes() {
        let (_dir, storage) = store().await;
        let thin = add_rule(storage.as_ref(), 1.0).await;
        let failing = add_rule(storage.as_ref(), 1.0).await;
        let strong = add_rule(storage.as_ref(), 2.0).await;
        judge(storage.as_ref(), &thin, 0, 4).await;
        judge(storage.as_ref(), &failing, 1, 9).await;
        judge(storage.as_ref(), &strong, 9, 1).await;

        let engine = EvolutionEngine::new(storage.clone());
        let report = engine.evolve().await.unwrap();

        assert_eq!(report.summary.active_rules_before, 3);
        assert_eq!(report.deactivated, vec![failing.id]);
        assert_eq!(report.created.len(), 1);
        assert!(report.failures.is_empty());

        let child = &report.created[0];
        assert_eq!(child.parent_id, Some(strong.id));
        assert_eq!(child.lineage_id, strong.lineage_id);
        assert_eq!(child.pattern, strong.pattern);
        assert_eq!(child.response, strong.response);
        assert_eq!(child.origin, RuleOrigin::Evolution);
        assert_eq!(child.weight, 2.0 + 0.15);
        assert!(child.active);
        let provenance = child.provenance.as_ref().unwrap();
        assert_eq!(provenance.evolved_from, strong.id);
        assert_eq!(provenance.parent_samples, 10);

        assert!(storage.get_rule(thin.id).await.unwrap().unwrap().active);
        assert!(!storage.get_rule(failing.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_child_weight_is_capped() {
        let (_dir, storage) = store().await;
        let strong = add_rule(storage.as_ref(), 49.95).await;
        judge(storage.as_ref(), &strong, 5, 0).await;

        let report = EvolutionEngine::new(storage).evolve().await.unwrap();
        assert_eq!(report.created[0].weight, 50.0);
    }

    async fn second_run_is_a_no_op(storage: Arc<dyn Storage>) {
        let failing = add_rule(storage.as_ref(), 1.0).await;
        let strong = add_rule(storage.as_ref(), 1.0).await;
        judge(storage.as_ref(), &failing, 0, 5).await;
        judge(storage.as_ref(), &strong, 5, 0).await;

        let engine = EvolutionEngine::new(storage.clone());
        let first = engine.evolve().await.unwrap();
        assert_eq!(first.summary.deactivated, 1);
        assert_eq!(first.summary.created, 1);

        let second = engine.evolve().await.unwrap();
        assert_eq!(second.summary.deactivated, 0);
        assert_eq!(second.summary.created, 0);
        assert_eq!(second.summary.active_rules_before, 2);

        // New evidence on the parent makes it eligible again.
        judge(storage.as_ref(), &strong, 1, 0).await;
        let third = engine.evolve().await.unwrap();
        assert_eq!(third.summary.created, 1);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let (_dir, storage) = store().await;
        second_run_is_a_no_op(storage).await;
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_second_run_is_a_no_op_on_sqlite() {
        let storage = genealogy_storage::SqliteStorage::in_memory().await.unwrap();
        second_run_is_a_no_op(Arc::new(storage)).await;
    }

    /// Two engines over two handles on one store, as two `evolve` processes.
    async fn concurrent_engines_promote_once(a: Arc<dyn Storage>, b: Arc<dyn Storage>) {
        let strong = add_rule(a.as_ref(), 1.0).await;
        judge(a.as_ref(), &strong, 5, 0).await;

        let first = EvolutionEngine::new(a.clone());
        let second = EvolutionEngine::new(b.clone());
        let (r1, r2) = tokio::join!(first.evolve(), second.evolve());

        let created = r1.unwrap().created.len() + r2.unwrap().created.len();
        assert_eq!(created, 1);
        assert_eq!(b.get_rules_by_lineage(strong.lineage_id).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engines_sharing_a_directory_promote_once() {
        for _ in 0..5 {
            let dir = tempfile::tempdir().unwrap();
            let a = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
            let b = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
            concurrent_engines_promote_once(a, b).await;
        }
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engines_sharing_a_database_promote_once() {
        use genealogy_storage::SqliteStorage;

        for _ in 0..5 {
            let dir = tempfile::tempdir().unwrap();
            let url = format!("sqlite://{}", dir.path().join("genes.db").display());
            let a = Arc::new(SqliteStorage::new(&url).await.unwrap());
            let b = Arc::new(SqliteStorage::new(&url).await.unwrap());
            concurrent_engines_promote_once(a, b).await;
        }
    }

    #[tokio::test]
    async fn test_run_waits_for_lease_then_gives_up() {
        let (_dir, storage) = store().await;
        let strong = add_rule(storage.as_ref(), 1.0).await;
        judge(storage.as_ref(), &strong, 5, 0).await;
        assert!(storage
            .try_acquire_lease(RUN_LEASE, "other-process", LEASE_TTL)
            .await
            .unwrap());

        let engine = EvolutionEngine::new(storage.clone()).with_lease_wait(Duration::from_millis(120));
        assert!(matches!(engine.evolve().await, Err(EvolutionError::Busy)));
        assert_eq!(storage.get_rules_by_lineage(strong.lineage_id).await.unwrap().len(), 1);

        storage.release_lease(RUN_LEASE, "other-process").await.unwrap();
        assert_eq!(engine.evolve().await.unwrap().created.len(), 1);
        // The run gave its lease back.
        assert!(storage
            .try_acquire_lease(RUN_LEASE, "other-process", LEASE_TTL)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rule_switched_off_meanwhile_is_not_reported() {
        let (_dir, inner) = store().await;
        let failing = add_rule(inner.as_ref(), 1.0).await;
        let also_failing = add_rule(inner.as_ref(), 1.0).await;
        judge(inner.as_ref(), &failing, 0, 5).await;
        judge(inner.as_ref(), &also_failing, 0, 5).await;
        inner.set_rule_active(failing.id, false).await.unwrap();

        let flaky = Arc::new(FlakyStorage::new(inner.clone()).stale_rule_list());
        let report = EvolutionEngine::new(flaky).evolve().await.unwrap();

        assert_eq!(report.deactivated, vec![also_failing.id]);
        assert_eq!(report.summary.deactivated, 1);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failures_are_reported() {
        let (_dir, inner) = store().await;
        let failing = add_rule(inner.as_ref(), 1.0).await;
        let strong = add_rule(inner.as_ref(), 1.0).await;
        judge(inner.as_ref(), &failing, 0, 5).await;
        judge(inner.as_ref(), &strong, 5, 0).await;

        let flaky = Arc::new(FlakyStorage::new(inner.clone()).failing_deactivate());
        let report = EvolutionEngine::new(flaky).evolve().await.unwrap();

        assert!(report.deactivated.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].rule_id, failing.id);
        // The promotion still went through.
        assert_eq!(report.created.len(), 1);
        assert!(inner.get_rule(failing.id).await.unwrap().unwrap().active);

    }

    #[tokio::test]
    async fn test_failed_clone_is_reported() {
        let (_dir, inner) = store().await;
        let failing = add_rule(inner.as_ref(), 1.0).await;
        let strong = add_rule(inner.as_ref(), 1.0).await;
        judge(inner.as_ref(), &failing, 0, 5).await;
        judge(inner.as_ref(), &strong, 5, 0).await;

        let flaky = Arc::new(FlakyStorage::new(inner.clone()).failing_insert());
        let report = EvolutionEngine::new(flaky).evolve().await.unwrap();

        assert_eq!(report.deactivated, vec![failing.id]);
        assert!(report.created.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].rule_id, strong.id);
        assert_eq!(inner.get_rules_by_lineage(strong.lineage_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_failure_aborts_run() {
        let (_dir, inner) = store().await;
        let failing = add_rule(inner.as_ref(), 1.0).await;
        judge(inner.as_ref(), &failing, 0, 5).await;

        let flaky = Arc::new(FlakyStorage::new(inner.clone()).failing_reads());
        let err = EvolutionEngine::new(flaky).evolve().await.unwrap_err();
        assert!(matches!(err, EvolutionError::Storage(_)));
        assert!(inner.get_rule(failing.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_lineage_walks_to_root() {
        let (_dir, storage) = store().await;
        let root = add_rule(storage.as_ref(), 1.0).await;
        judge(storage.as_ref(), &root, 5, 0).await;

        let engine = EvolutionEngine::new(storage.clone()).with_config(EvolutionConfig {
            promote_top_n: 2,
            ..Default::default()
        });
        let child = engine.evolve().await.unwrap().created.remove(0);
        judge(storage.as_ref(), &child, 5, 0).await;
        let report = engine.evolve().await.unwrap();
        // The root has no new evidence, so only the child is cloned.
        assert_eq!(report.created.len(), 1);
        let grandchild = &report.created[0];
        assert_eq!(grandchild.parent_id, Some(child.id));

        let chain: Vec<_> = engine
            .lineage(grandchild.id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(chain, vec![grandchild.id, child.id, root.id]);

        let members = engine.lineage_members(root.lineage_id).await.unwrap();
        assert_eq!(members.len(), 3);

        assert!(matches!(
            engine.lineage(RuleId(999)).await,
            Err(EvolutionError::RuleNotFound(RuleId(999)))
        ));
    }

    #[tokio::test]
    async fn test_run_periodic_stops_on_shutdown() {
        let (_dir, storage) = store().await;
        let failing = add_rule(storage.as_ref(), 1.0).await;
        judge(storage.as_ref(), &failing, 0, 5).await;

        let engine = EvolutionEngine::new(storage.clone());
        let (tx, rx) = watch::channel(false);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        tokio::join!(engine.run_periodic(Duration::from_millis(10), rx), stop);

        assert!(!storage.get_rule(failing.id).await.unwrap().unwrap().active);
    }
}
