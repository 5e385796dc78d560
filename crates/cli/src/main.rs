//! Genealogy CLI - weighted rule decisions, feedback and evolution.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use genealogy_core::{NewRule, Pattern, RuleId, RuleOrigin};
use genealogy_evolution::EvolutionEngine;
use genealogy_execution::{DecideRequest, DecisionEngine, EngineConfig, Fallback, RecorderConfig};
use genealogy_feedback::{FeedbackProcessor, FeedbackRequest};
use genealogy_storage::{JsonStorage, Storage};

use crate::config::{Backend, Config};

#[derive(Parser)]
#[command(name = "genealogy")]
#[command(about = "Weighted rule matching with feedback-driven evolution", long_about = None)]
struct Cli {
    /// Directory of the JSON store (overrides GENEALOGY_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// SQLite URL (overrides GENEALOGY_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide on an event and record the decision
    Decide {
        #[command(flatten)]
        event: EventArgs,
    },
    /// Store an event without deciding
    Ingest {
        #[command(flatten)]
        event: EventArgs,
    },
    /// Report the outcome of a decision
    Feedback {
        /// Decision ID
        decision_id: i64,
        /// Outcome (success, fail, unknown, ...)
        #[arg(long)]
        outcome: Option<String>,
        /// Numeric score
        #[arg(long, allow_hyphen_values = true)]
        score: Option<f64>,
    },
    /// Apply a JSON array of feedback items from a file
    FeedbackBatch {
        /// Path to the JSON file
        file: PathBuf,
    },
    /// Run evolution once, or periodically until Ctrl-C
    Evolve {
        /// Seconds between runs
        #[arg(long)]
        every: Option<u64>,
    },
    /// Manage rules
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },
    /// Feedback statistics for active rules
    Stats,
    /// Check the store is reachable
    Health,
}

#[derive(clap::Args)]
struct EventArgs {
    /// Event type
    #[arg(long = "type", default_value = "event")]
    event_type: String,
    /// Metadata JSON object
    #[arg(long, default_value = "{}")]
    metadata: String,
    /// Context JSON object
    #[arg(long, default_value = "{}")]
    context: String,
}

impl EventArgs {
    fn into_request(self) -> Result<DecideRequest> {
        let metadata: Value = serde_json::from_str(&self.metadata).context("--metadata is not valid JSON")?;
        let context: Value = serde_json::from_str(&self.context).context("--context is not valid JSON")?;
        Ok(DecideRequest::from_json(json!({
            "event_type": self.event_type,
            "metadata": metadata,
            "context": context,
        }))?)
    }
}

#[derive(Subcommand)]
enum RuleCommands {
    /// Add a root rule
    Add {
        /// Pattern JSON object
        #[arg(long, default_value = "{}")]
        pattern: String,
        /// Response JSON
        #[arg(long)]
        response: String,
        /// Initial weight
        #[arg(long, default_value = "1.0")]
        weight: f64,
        /// Classification label
        #[arg(long)]
        rule_type: Option<String>,
        /// Origin (seed or operator)
        #[arg(long, default_value = "operator")]
        origin: String,
    },
    /// List rules
    List {
        /// Include inactive rules
        #[arg(long)]
        all: bool,
    },
    /// Show rule details
    Show {
        /// Rule ID
        id: i64,
    },
    /// Show a rule's ancestors, or its whole lineage with --members
    Lineage {
        /// Rule ID
        id: i64,
        /// List every rule of the lineage instead
        #[arg(long)]
        members: bool,
    },
    /// Make a rule eligible for matching
    Activate {
        /// Rule ID
        id: i64,
    },
    /// Retire a rule
    Deactivate {
        /// Rule ID
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    config::load_dotenv();
    let cli = Cli::parse();

    let deciding = matches!(cli.command, Commands::Decide { .. });

    let config = match Config::load(cli.data_dir, cli.database_url) {
        Ok(config) => config,
        Err(e) if deciding => return print_json(&fallback(format!("configuration error: {}", e))),
        Err(e) => return Err(e.into()),
    };
    config.log_summary();

    let storage = if deciding {
        match open_storage_for_decide(&config).await {
            Ok(storage) => storage,
            Err(fallback) => return print_json(&fallback),
        }
    } else {
        open_storage(&config).await?
    };

    match cli.command {
        Commands::Decide { event } => {
            let engine = DecisionEngine::new(storage).with_config(EngineConfig {
                recorder: RecorderConfig::default(),
                prefer_specific: config.prefer_specific,
            });
            let outcome = engine.decide(event.into_request()?).await?;
            print_json(&outcome)?;
        }
        Commands::Ingest { event } => {
            let engine = DecisionEngine::new(storage);
            let stored = engine.ingest(event.into_request()?).await?;
            print_json(&stored)?;
        }
        Commands::Feedback { decision_id, outcome, score } => {
            let request = feedback_request(decision_id, outcome, score)?;
            let processor = FeedbackProcessor::new(storage).with_config(config.feedback);
            let result = processor.apply_feedback(request).await?;
            print_json(&result)?;
        }
        Commands::FeedbackBatch { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let body: Value = serde_json::from_str(&raw).context("batch file is not valid JSON")?;
            let Value::Array(items) = body else {
                bail!("batch file must contain a JSON array");
            };
            let requests = items
                .iter()
                .enumerate()
                .map(|(i, item)| FeedbackRequest::from_json(item).with_context(|| format!("item {}", i)))
                .collect::<Result<Vec<_>>>()?;

            let processor = FeedbackProcessor::new(storage).with_config(config.feedback);
            let report = processor.apply_batch(requests).await;
            print_json(&report)?;
        }
        Commands::Evolve { every } => {
            let engine = EvolutionEngine::new(storage).with_config(config.evolution);
            match every {
                None => print_json(&engine.evolve().await?)?,
                Some(0) => bail!("--every must be at least 1 second"),
                Some(secs) => {
                    let (tx, rx) = tokio::sync::watch::channel(false);
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            info!("Shutdown requested");
                            let _ = tx.send(true);
                        }
                    });
                    engine.run_periodic(Duration::from_secs(secs), rx).await;
                }
            }
        }
        Commands::Rule { command } => run_rule_command(storage, command).await?,
        Commands::Stats => {
            let engine = EvolutionEngine::new(storage).with_config(config.evolution);
            let stats: Vec<Value> = engine
                .stats()
                .await?
                .into_iter()
                .map(|s| {
                    json!({
                        "rule_id": s.rule_id,
                        "samples": s.samples,
                        "success": s.success,
                        "fail": s.fail,
                        "success_rate": s.success_rate(),
                    })
                })
                .collect();
            print_json(&stats)?;
        }
        Commands::Health => {
            let healthy = storage.health_check().await;
            print_json(&json!({ "healthy": healthy }))?;
            if !healthy {
                bail!("storage health check failed");
            }
        }
    }

    Ok(())
}

async fn run_rule_command(storage: Arc<dyn Storage>, command: RuleCommands) -> Result<()> {
    match command {
        RuleCommands::Add { pattern, response, weight, rule_type, origin } => {
            let pattern: Value = serde_json::from_str(&pattern).context("--pattern is not valid JSON")?;
            let response: Value = serde_json::from_str(&response).context("--response is not valid JSON")?;
            let origin: RuleOrigin = origin.parse().map_err(anyhow::Error::msg)?;
            if origin == RuleOrigin::Evolution {
                bail!("evolved rules are only created by `evolve`");
            }
            if !weight.is_finite() || weight < 0.0 {
                bail!("--weight must be a non-negative number");
            }

            let mut rule = NewRule::new(Pattern::from_value(pattern)?, response, weight).with_origin(origin);
            if let Some(rule_type) = rule_type {
                rule = rule.with_rule_type(rule_type);
            }
            let stored = storage.insert_rule(&rule).await?;
            info!("Added rule {} ({})", stored.id, stored.lineage_id);
            print_json(&stored)?;
        }
        RuleCommands::List { all } => {
            let rules = if all {
                storage.list_rules().await?
            } else {
                storage.get_active_rules().await?
            };
            print_json(&rules)?;
        }
        RuleCommands::Show { id } => {
            let Some(rule) = storage.get_rule(RuleId(id)).await? else {
                bail!("rule not found: {}", id);
            };
            print_json(&rule)?;
        }
        RuleCommands::Lineage { id, members } => {
            let engine = EvolutionEngine::new(storage);
            let chain = engine.lineage(RuleId(id)).await?;
            if members {
                let Some(rule) = chain.first() else {
                    bail!("rule not found: {}", id);
                };
                print_json(&engine.lineage_members(rule.lineage_id).await?)?;
            } else {
                print_json(&chain)?;
            }
        }
        RuleCommands::Activate { id } => {
            print_json(&storage.set_rule_active(RuleId(id), true).await?)?;
        }
        RuleCommands::Deactivate { id } => {
            print_json(&storage.set_rule_active(RuleId(id), false).await?)?;
        }
    }
    Ok(())
}

fn feedback_request(decision_id: i64, outcome: Option<String>, score: Option<f64>) -> Result<FeedbackRequest> {
    // JSON has no NaN; serializing one would silently drop the score.
    if score.is_some_and(|s| !s.is_finite()) {
        bail!("--score must be a finite number");
    }
    Ok(FeedbackRequest::from_json(&json!({
        "decision_id": decision_id,
        "outcome": outcome,
        "score": score,
    }))?)
}

/// The answer `decide` gives when it cannot reach a store.
fn fallback(note: String) -> Fallback {
    tracing::error!("Answering with the fallback decision: {}", note);
    DecisionEngine::fallback(&RecorderConfig::default(), note)
}

async fn open_storage_for_decide(config: &Config) -> std::result::Result<Arc<dyn Storage>, Fallback> {
    open_storage(config)
        .await
        .map_err(|e| fallback(format!("storage unavailable: {:#}", e)))
}

async fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match &config.backend {
        Backend::Json { data_dir } => {
            let storage = JsonStorage::new(data_dir)
                .await
                .with_context(|| format!("failed to open JSON store at {}", data_dir.display()))?;
            Ok(Arc::new(storage))
        }
        #[cfg(feature = "sqlite")]
        Backend::Sqlite { url } => {
            let storage = genealogy_storage::SqliteStorage::new(url)
                .await
                .with_context(|| format!("failed to open SQLite store at {}", url))?;
            Ok(Arc::new(storage))
        }
        #[cfg(not(feature = "sqlite"))]
        Backend::Sqlite { url } => Err(crate::config::ConfigError::UnsupportedBackend(url.clone()).into()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
