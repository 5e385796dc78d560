//! SQLite storage backend for the gene registry.
//!
//! One table per record kind. Patterns, responses and metadata are stored as
//! JSON text. Weight adjustments are a single `UPDATE ... RETURNING`
//! statement, so concurrent feedback on one rule cannot lose updates.
//! Leases are rows in `leases`, taken with a conditional upsert.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genealogy_core::{
    clamp_weight, Decision, DecisionId, Event, EventId, Feedback, FeedbackId, LineageId,
    NewDecision, NewEvent, NewFeedback, NewRule, Outcome, Rule, RuleId, RuleOrigin,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, warn};

use super::trait_::{Result, Storage, StorageError};

/// Max ids bound into one `IN (...)` list.
const IN_CHUNK: usize = 500;

const RULE_COLUMNS: &str = "id, lineage_id, parent_id, rule_type, origin, pattern, response, weight, active, provenance, created_at";

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) a database from a `sqlite:` URL or path.
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create an in-memory SQLite storage for testing.
    ///
    /// Limited to one connection: every connection to `:memory:` is its own
    /// database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lineage_id TEXT NOT NULL,
                parent_id INTEGER REFERENCES rules(id),
                rule_type TEXT NOT NULL,
                origin TEXT NOT NULL,
                pattern TEXT NOT NULL,
                response TEXT NOT NULL,
                weight REAL NOT NULL CHECK (weight >= 0),
                active INTEGER NOT NULL,
                provenance TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                metadata TEXT NOT NULL,
                context TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id INTEGER NOT NULL REFERENCES events(id),
                rule_id INTEGER REFERENCES rules(id),
                response TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                decision_id INTEGER NOT NULL REFERENCES decisions(id),
                outcome TEXT NOT NULL,
                score REAL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_rules_active ON rules(active)",
            "CREATE INDEX IF NOT EXISTS idx_rules_lineage ON rules(lineage_id)",
            "CREATE INDEX IF NOT EXISTS idx_decisions_rule ON decisions(rule_id)",
            "CREATE INDEX IF NOT EXISTS idx_feedback_decision ON feedback(decision_id)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }

        Ok(())
    }

    async fn fetch_rules(&self, filter: &str) -> Result<Vec<Rule>> {
        let sql = format!("SELECT {} FROM rules {} ORDER BY id", RULE_COLUMNS, filter);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(rule_from_row).collect()
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    // === Rule operations ===

    async fn get_active_rules(&self) -> Result<Vec<Rule>> {
        self.fetch_rules("WHERE active = 1").await
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        self.fetch_rules("").await
    }

    async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        let sql = format!("SELECT {} FROM rules WHERE id = ?", RULE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(rule_from_row).transpose()
    }

    async fn get_rules_by_lineage(&self, lineage: LineageId) -> Result<Vec<Rule>> {
        let sql = format!(
            "SELECT {} FROM rules WHERE lineage_id = ? ORDER BY id",
            RULE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(lineage.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn insert_rule(&self, rule: &NewRule) -> Result<Rule> {
        let pattern = serde_json::to_string(&rule.pattern)?;
        let response = serde_json::to_string(&rule.response)?;
        let provenance = rule
            .provenance
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            "INSERT INTO rules (lineage_id, parent_id, rule_type, origin, pattern, response, weight, active, provenance, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(rule.lineage_id.to_string())
        .bind(rule.parent_id.map(RuleId::get))
        .bind(&rule.rule_type)
        .bind(rule.origin.as_str())
        .bind(pattern)
        .bind(response)
        .bind(clamp_weight(rule.weight))
        .bind(rule.active)
        .bind(provenance)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let id = RuleId(result.last_insert_rowid());
        debug!("Inserted rule {} (lineage {})", id, rule.lineage_id);

        let mut stored = rule.clone().into_rule(id);
        stored.weight = clamp_weight(stored.weight);
        Ok(stored)
    }

    async fn update_rule_weight(&self, id: RuleId, weight: f64) -> Result<Rule> {
        let sql = format!(
            "UPDATE rules SET weight = ? WHERE id = ? RETURNING {}",
            RULE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(clamp_weight(weight))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref()
            .map(rule_from_row)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound(format!("rule {}", id)))
    }

    async fn adjust_rule_weight(&self, id: RuleId, delta: f64) -> Result<Rule> {
        if !delta.is_finite() {
            return Err(StorageError::Other(format!("non-finite weight delta {}", delta)));
        }

        let sql = format!(
            "UPDATE rules SET weight = MAX(0.0, weight + ?) WHERE id = ? RETURNING {}",
            RULE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(delta)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref()
            .map(rule_from_row)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound(format!("rule {}", id)))
    }

    async fn deactivate_rules(&self, ids: &[RuleId]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut count = 0;

        for chunk in ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE rules SET active = 0 WHERE active = 1 AND id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.get());
            }
            separated.push_unseparated(")");

            let result = qb.build().execute(&mut *tx).await.map_err(db_err)?;
            count += result.rows_affected();
        }

        tx.commit().await.map_err(db_err)?;
        Ok(count)
    }

    async fn set_rule_active(&self, id: RuleId, active: bool) -> Result<Rule> {
        let sql = format!(
            "UPDATE rules SET active = ? WHERE id = ? RETURNING {}",
            RULE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(active)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref()
            .map(rule_from_row)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound(format!("rule {}", id)))
    }

    // === Event operations ===

    async fn insert_event(&self, event: &NewEvent) -> Result<EventId> {
        let result = sqlx::query(
            "INSERT INTO events (event_type, metadata, context, source, created_at)
            VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.event_type)
        .bind(serde_json::to_string(&event.metadata)?)
        .bind(serde_json::to_string(&event.context)?)
        .bind(&event.source)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(EventId(result.last_insert_rowid()))
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let row = sqlx::query(
            "SELECT id, event_type, metadata, context, source, created_at FROM events WHERE id = ?",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Event {
            id: EventId(row.try_get("id").map_err(db_err)?),
            event_type: row.try_get("event_type").map_err(db_err)?,
            metadata: json_column(&row, "metadata")?,
            context: json_column(&row, "context")?,
            source: row.try_get("source").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
        }))
    }

    // === Decision operations ===

    async fn insert_decision(&self, decision: &NewDecision) -> Result<DecisionId> {
        let result = sqlx::query(
            "INSERT INTO decisions (event_id, rule_id, response, confidence, created_at)
            VALUES (?, ?, ?, ?, ?)",
        )
        .bind(decision.event_id.get())
        .bind(decision.rule_id.map(RuleId::get))
        .bind(serde_json::to_string(&decision.response)?)
        .bind(decision.confidence)
        .bind(decision.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(DecisionId(result.last_insert_rowid()))
    }

    async fn get_decision(&self, id: DecisionId) -> Result<Option<Decision>> {
        let row = sqlx::query(
            "SELECT id, event_id, rule_id, response, confidence, created_at FROM decisions WHERE id = ?",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(decision_from_row).transpose()
    }

    async fn get_decisions_by_rule_ids(&self, ids: &[RuleId]) -> Result<Vec<Decision>> {
        let mut decisions = Vec::new();

        for chunk in ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, event_id, rule_id, response, confidence, created_at FROM decisions WHERE rule_id IN (",
            );
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.get());
            }
            separated.push_unseparated(") ORDER BY id");

            let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
            for row in &rows {
                decisions.push(decision_from_row(row)?);
            }
        }

        decisions.sort_by_key(|d| d.id);
        Ok(decisions)
    }

    // === Feedback operations ===

    async fn insert_feedback(&self, feedback: &NewFeedback) -> Result<FeedbackId> {
        let result = sqlx::query(
            "INSERT INTO feedback (decision_id, outcome, score, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(feedback.decision_id.get())
        .bind(feedback.outcome.as_str())
        .bind(feedback.score)
        .bind(feedback.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(FeedbackId(result.last_insert_rowid()))
    }

    async fn get_feedback_by_decision_ids(&self, ids: &[DecisionId]) -> Result<Vec<Feedback>> {
        let mut feedback = Vec::new();

        for chunk in ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, decision_id, outcome, score, created_at FROM feedback WHERE decision_id IN (",
            );
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.get());
            }
            separated.push_unseparated(") ORDER BY id");

            let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
            for row in &rows {
                let outcome: String = row.try_get("outcome").map_err(db_err)?;
                feedback.push(Feedback {
                    id: FeedbackId(row.try_get("id").map_err(db_err)?),
                    decision_id: DecisionId(row.try_get("decision_id").map_err(db_err)?),
                    outcome: Outcome::parse(&outcome),
                    score: row.try_get("score").map_err(db_err)?,
                    created_at: row.try_get("created_at").map_err(db_err)?,
                });
            }
        }

        feedback.sort_by_key(|f| f.id);
        Ok(feedback)
    }

    // === Leases ===

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let result = sqlx::query(
            "INSERT INTO leases (name, holder, acquired_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, acquired_at = excluded.acquired_at
            WHERE leases.holder = excluded.holder OR leases.acquired_at <= ?",
        )
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(now.saturating_sub(ttl_ms))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let acquired = result.rows_affected() > 0;
        debug!("Lease {} for {}: {}", name, holder, if acquired { "taken" } else { "busy" });
        Ok(acquired)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!("SQLite health check failed: {}", e);
                false
            }
        }
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let text: String = row.try_get(column).map_err(db_err)?;
    Ok(serde_json::from_str(&text)?)
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule> {
    let lineage: String = row.try_get("lineage_id").map_err(db_err)?;
    let origin: String = row.try_get("origin").map_err(db_err)?;
    let provenance: Option<String> = row.try_get("provenance").map_err(db_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_err)?;

    Ok(Rule {
        id: RuleId(row.try_get("id").map_err(db_err)?),
        lineage_id: lineage
            .parse()
            .map_err(|e| StorageError::Other(format!("bad lineage id {}: {}", lineage, e)))?,
        parent_id: row
            .try_get::<Option<i64>, _>("parent_id")
            .map_err(db_err)?
            .map(RuleId),
        rule_type: row.try_get("rule_type").map_err(db_err)?,
        origin: origin.parse::<RuleOrigin>().map_err(StorageError::Other)?,
        pattern: json_column(row, "pattern")?,
        response: json_column(row, "response")?,
        weight: row.try_get("weight").map_err(db_err)?,
        active: row.try_get("active").map_err(db_err)?,
        provenance: provenance
            .map(|text| serde_json::from_str(&text))
            .transpose()?,
        created_at,
    })
}

fn decision_from_row(row: &SqliteRow) -> Result<Decision> {
    Ok(Decision {
        id: DecisionId(row.try_get("id").map_err(db_err)?),
        event_id: EventId(row.try_get("event_id").map_err(db_err)?),
        rule_id: row
            .try_get::<Option<i64>, _>("rule_id")
            .map_err(db_err)?
            .map(RuleId),
        response: json_column(row, "response")?,
        confidence: row.try_get("confidence").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}
