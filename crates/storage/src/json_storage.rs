//! JSON file storage implementation.
//!
//! Stores every record as a JSON file under a data directory and keeps the
//! id sequences in `meta/sequences.json`. Every mutation holds an async
//! mutex for the handle and the lock file `meta/write.lock` for the
//! directory, so handles in different processes sharing one directory
//! still allocate distinct ids and never lose a weight adjustment.
//! Appended records are never overwritten. Files are replaced by
//! write-then-rename so readers never see a half-written record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genealogy_core::{
    clamp_weight, Decision, DecisionId, Event, EventId, Feedback, FeedbackId, LineageId,
    NewDecision, NewEvent, NewFeedback, NewRule, Rule, RuleId,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::lock::FileLock;
use super::{Result, Storage, StorageError};

const RULES: &str = "rules";
const EVENTS: &str = "events";
const DECISIONS: &str = "decisions";
const FEEDBACK: &str = "feedback";
const META: &str = "meta";

const WRITE_LOCK: &str = "write.lock";
/// Writes hold the lock for milliseconds; anything this old was abandoned.
const WRITE_LOCK_STALE: Duration = Duration::from_secs(30);
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct Lease {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// Both halves of the write lock. The file is released first.
struct WriteGuard<'a> {
    _file: FileLock,
    _local: MutexGuard<'a, ()>,
}

/// File-based JSON storage backend.
pub struct JsonStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStorage {
    /// Create storage, creating the data directories if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        for kind in [RULES, EVENTS, DECISIONS, FEEDBACK, META] {
            fs::create_dir_all(root.join(kind)).await?;
        }

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Data directory this store writes to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, id: i64) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", id))
    }

    fn sequences_path(&self) -> PathBuf {
        self.root.join(META).join("sequences.json")
    }

    fn lease_path(&self, name: &str) -> PathBuf {
        self.root.join(META).join(format!("{}.lease.json", name))
    }

    async fn lock(&self) -> Result<WriteGuard<'_>> {
        let local = self.write_lock.lock().await;
        let file = FileLock::acquire(
            self.root.join(META).join(WRITE_LOCK),
            WRITE_LOCK_STALE,
            WRITE_LOCK_WAIT,
        )
        .await?;
        Ok(WriteGuard {
            _file: file,
            _local: local,
        })
    }

    /// Allocate the next id for `kind`. Caller must hold the write lock.
    async fn next_id(&self, kind: &str) -> Result<i64> {
        let path = self.sequences_path();
        let mut sequences: serde_json::Map<String, serde_json::Value> =
            read_json(&path).await?.unwrap_or_default();

        let next = sequences.get(kind).and_then(|v| v.as_i64()).unwrap_or(0) + 1;
        sequences.insert(kind.to_string(), next.into());
        write_json(&path, &sequences).await?;
        Ok(next)
    }

    /// Write a new record. Caller must hold the write lock.
    async fn append<T: Serialize>(&self, kind: &str, id: i64, value: &T) -> Result<()> {
        let path = self.record_path(kind, id);
        if fs::try_exists(&path).await? {
            return Err(StorageError::Other(format!(
                "{} {} already exists; {} is out of step",
                kind,
                id,
                self.sequences_path().display()
            )));
        }
        write_json(&path, value).await
    }

    async fn load_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        read_json(&self.record_path(RULES, id.get())).await
    }

    async fn save_rule(&self, rule: &Rule) -> Result<()> {
        write_json(&self.record_path(RULES, rule.id.get()), rule).await
    }

    async fn all_rules(&self) -> Result<Vec<Rule>> {
        let mut rules: Vec<Rule> = list_dir(&self.root.join(RULES)).await?;
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    /// Load-modify-store a rule under the write lock.
    async fn modify_rule(&self, id: RuleId, f: impl FnOnce(&mut Rule)) -> Result<Rule> {
        let _guard = self.lock().await?;
        let mut rule = self
            .load_rule(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("rule {}", id)))?;
        f(&mut rule);
        self.save_rule(&rule).await?;
        Ok(rule)
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn get_active_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.all_rules().await?.into_iter().filter(|r| r.active).collect())
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        self.all_rules().await
    }

    async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        self.load_rule(id).await
    }

    async fn get_rules_by_lineage(&self, lineage: LineageId) -> Result<Vec<Rule>> {
        Ok(self
            .all_rules()
            .await?
            .into_iter()
            .filter(|r| r.lineage_id == lineage)
            .collect())
    }

    async fn insert_rule(&self, rule: &NewRule) -> Result<Rule> {
        let _guard = self.lock().await?;
        let id = RuleId(self.next_id(RULES).await?);
        let mut stored = rule.clone().into_rule(id);
        stored.weight = clamp_weight(stored.weight);
        self.append(RULES, id.get(), &stored).await?;
        debug!("Inserted rule {} (lineage {})", id, stored.lineage_id);
        Ok(stored)
    }

    async fn update_rule_weight(&self, id: RuleId, weight: f64) -> Result<Rule> {
        self.modify_rule(id, |rule| rule.weight = clamp_weight(weight)).await
    }

    async fn adjust_rule_weight(&self, id: RuleId, delta: f64) -> Result<Rule> {
        self.modify_rule(id, |rule| rule.weight = clamp_weight(rule.weight + delta))
            .await
    }

    async fn deactivate_rules(&self, ids: &[RuleId]) -> Result<u64> {
        let _guard = self.lock().await?;
        let mut count = 0;
        for &id in ids {
            let Some(mut rule) = self.load_rule(id).await? else {
                continue;
            };
            if rule.active {
                rule.active = false;
                self.save_rule(&rule).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn set_rule_active(&self, id: RuleId, active: bool) -> Result<Rule> {
        self.modify_rule(id, |rule| rule.active = active).await
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<EventId> {
        let _guard = self.lock().await?;
        let id = EventId(self.next_id(EVENTS).await?);
        let stored = event.clone().into_event(id);
        self.append(EVENTS, id.get(), &stored).await?;
        Ok(id)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        read_json(&self.record_path(EVENTS, id.get())).await
    }

    async fn insert_decision(&self, decision: &NewDecision) -> Result<DecisionId> {
        let _guard = self.lock().await?;
        let id = DecisionId(self.next_id(DECISIONS).await?);
        let stored = decision.clone().into_decision(id);
        self.append(DECISIONS, id.get(), &stored).await?;
        Ok(id)
    }

    async fn get_decision(&self, id: DecisionId) -> Result<Option<Decision>> {
        read_json(&self.record_path(DECISIONS, id.get())).await
    }

    async fn get_decisions_by_rule_ids(&self, ids: &[RuleId]) -> Result<Vec<Decision>> {
        let wanted: HashSet<RuleId> = ids.iter().copied().collect();
        let mut decisions: Vec<Decision> = list_dir(&self.root.join(DECISIONS)).await?;
        decisions.retain(|d| d.rule_id.is_some_and(|r| wanted.contains(&r)));
        decisions.sort_by_key(|d| d.id);
        Ok(decisions)
    }

    async fn insert_feedback(&self, feedback: &NewFeedback) -> Result<FeedbackId> {
        let _guard = self.lock().await?;
        let id = FeedbackId(self.next_id(FEEDBACK).await?);
        let stored = feedback.clone().into_feedback(id);
        self.append(FEEDBACK, id.get(), &stored).await?;
        Ok(id)
    }

    async fn get_feedback_by_decision_ids(&self, ids: &[DecisionId]) -> Result<Vec<Feedback>> {
        let wanted: HashSet<DecisionId> = ids.iter().copied().collect();
        let mut feedback: Vec<Feedback> = list_dir(&self.root.join(FEEDBACK)).await?;
        feedback.retain(|f| wanted.contains(&f.decision_id));
        feedback.sort_by_key(|f| f.id);
        Ok(feedback)
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let _guard = self.lock().await?;
        let path = self.lease_path(name);
        let now = Utc::now();

        if let Some(current) = read_json::<Lease>(&path).await? {
            let expired = (now - current.acquired_at)
                .to_std()
                .is_ok_and(|age| age >= ttl);
            if current.holder != holder {
                if !expired {
                    return Ok(false);
                }
                warn!("Lease {} held by {} expired, taking it over", name, current.holder);
            }
        }

        write_json(
            &path,
            &Lease {
                holder: holder.to_string(),
                acquired_at: now,
            },
        )
        .await?;
        debug!("Lease {} taken by {}", name, holder);
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let _guard = self.lock().await?;
        let path = self.lease_path(name);
        match read_json::<Lease>(&path).await? {
            Some(current) if current.holder == holder => {
                fs::remove_file(&path).await?;
                debug!("Lease {} released by {}", name, holder);
            }
            _ => {}
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        fs::metadata(self.root.join(RULES)).await.is_ok()
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        if let Some(item) = read_json(&entry.path()).await? {
            items.push(item);
        }
    }
    Ok(items)
}
