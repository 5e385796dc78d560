//! Runtime configuration from the environment and command-line overrides.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use genealogy_evolution::EvolutionConfig;
use genealogy_feedback::FeedbackConfig;

const DATA_DIR: &str = "GENEALOGY_DATA_DIR";
const DATABASE_URL: &str = "GENEALOGY_DATABASE_URL";
const FEEDBACK_STEP: &str = "GENEALOGY_FEEDBACK_STEP";
const MIN_SAMPLES: &str = "GENEALOGY_MIN_SAMPLES";
const FAIL_THRESHOLD: &str = "GENEALOGY_FAIL_THRESHOLD";
const PROMOTE_TOP_N: &str = "GENEALOGY_PROMOTE_TOP_N";
const MUTATION_DELTA: &str = "GENEALOGY_MUTATION_DELTA";
const WEIGHT_CAP: &str = "GENEALOGY_WEIGHT_CAP";
const PREFER_SPECIFIC: &str = "GENEALOGY_PREFER_SPECIFIC";

const DEFAULT_DATA_DIR: &str = ".genealogy";

/// Configuration problems found at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting could not be parsed or is out of range
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// The configured store is not compiled in or not recognized
    #[error("unsupported storage backend: {0}")]
    UnsupportedBackend(String),
}

/// Where registry state lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    /// One JSON file per record under a directory
    Json { data_dir: PathBuf },
    /// SQLite database
    Sqlite { url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    pub feedback: FeedbackConfig,
    pub evolution: EvolutionConfig,
    pub prefer_specific: bool,
}

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    /// Build config from the environment; explicit flags win over variables.
    pub fn load(data_dir: Option<PathBuf>, database_url: Option<String>) -> Result<Self, ConfigError> {
        let data_dir = data_dir.map(|p| p.to_string_lossy().into_owned());
        Self::from_lookup(|key| match key {
            DATA_DIR if data_dir.is_some() => data_dir.clone(),
            DATABASE_URL if database_url.is_some() => database_url.clone(),
            _ => env_opt(key),
        })
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = match lookup(DATABASE_URL) {
            Some(url) => sqlite_backend(url)?,
            None => Backend::Json {
                data_dir: PathBuf::from(lookup(DATA_DIR).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string())),
            },
        };

        let mut feedback = FeedbackConfig::default();
        if let Some(step) = parsed::<f64>(&lookup, FEEDBACK_STEP)? {
            if !step.is_finite() || step < 0.0 {
                return Err(invalid(FEEDBACK_STEP, step.to_string(), "must be a non-negative number"));
            }
            feedback.step = step;
        }

        let defaults = EvolutionConfig::default();
        let evolution = EvolutionConfig {
            min_samples: parsed(&lookup, MIN_SAMPLES)?.unwrap_or(defaults.min_samples),
            fail_threshold: parsed(&lookup, FAIL_THRESHOLD)?.unwrap_or(defaults.fail_threshold),
            promote_top_n: parsed(&lookup, PROMOTE_TOP_N)?.unwrap_or(defaults.promote_top_n),
            mutation_delta: parsed(&lookup, MUTATION_DELTA)?.unwrap_or(defaults.mutation_delta),
            weight_cap: parsed(&lookup, WEIGHT_CAP)?.unwrap_or(defaults.weight_cap),
        };
        evolution
            .validate()
            .map_err(|e| invalid("GENEALOGY_* evolution settings", String::new(), e.to_string()))?;

        let prefer_specific = match lookup(PREFER_SPECIFIC) {
            None => false,
            Some(raw) => parse_flag(&raw).ok_or_else(|| invalid(PREFER_SPECIFIC, raw, "expected true or false"))?,
        };

        Ok(Self {
            backend,
            feedback,
            evolution,
            prefer_specific,
        })
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        match &self.backend {
            Backend::Json { data_dir } => tracing::debug!("storage: json, data_dir={}", data_dir.display()),
            Backend::Sqlite { url } => tracing::debug!("storage: sqlite, url={}", url),
        }
        tracing::debug!(
            "feedback step={}, evolution={:?}, prefer_specific={}",
            self.feedback.step,
            self.evolution,
            self.prefer_specific
        );
    }
}

fn sqlite_backend(url: String) -> Result<Backend, ConfigError> {
    if !url.starts_with("sqlite:") {
        return Err(ConfigError::UnsupportedBackend(url));
    }
    if !cfg!(feature = "sqlite") {
        return Err(ConfigError::UnsupportedBackend(format!(
            "{} (built without the `sqlite` feature)",
            url
        )));
    }
    Ok(Backend::Sqlite { url })
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, raw.clone(), e.to_string())),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(key: &'static str, value: String, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value,
        reason: reason.into(),
    }
}
