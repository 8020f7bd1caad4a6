//! Client configuration.
//!
//! Layering, lowest priority first: built-in defaults, an optional JSON file,
//! `MNEME_*` environment variables, then whatever the binary applies from
//! its command line.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::batcher::BatchConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::models::IntelligenceLevel;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8787";

/// When to run the original handler for a URL the service already knows.
///
/// Accepts `false`, `true`, a single label, or a list of labels in JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AlwaysRunRepr", into = "AlwaysRunRepr")]
pub enum AlwaysRun {
    /// Known URLs are skipped.
    #[default]
    Never,
    /// The handler always runs.
    Always,
    /// The handler runs for known URLs whose request label is listed.
    Labels(Vec<String>),
}

impl AlwaysRun {
    pub fn should_run(&self, label: Option<&str>) -> bool {
        match self {
            AlwaysRun::Never => false,
            AlwaysRun::Always => true,
            AlwaysRun::Labels(labels) => {
                label.is_some_and(|label| labels.iter().any(|l| l == label))
            }
        }
    }
}

impl FromStr for AlwaysRun {
    type Err = String;

    /// `true`/`false`, or a comma-separated label list.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "true" | "always" => return Ok(AlwaysRun::Always),
            "false" | "never" | "" => return Ok(AlwaysRun::Never),
            _ => {}
        }

        let labels: Vec<String> = trimmed
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if labels.is_empty() {
            return Err(format!("Invalid always-run policy: {s}"));
        }
        Ok(AlwaysRun::Labels(labels))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AlwaysRunRepr {
    Flag(bool),
    Label(String),
    Labels(Vec<String>),
}

impl From<AlwaysRunRepr> for AlwaysRun {
    fn from(repr: AlwaysRunRepr) -> Self {
        match repr {
            AlwaysRunRepr::Flag(true) => AlwaysRun::Always,
            AlwaysRunRepr::Flag(false) => AlwaysRun::Never,
            AlwaysRunRepr::Label(label) => AlwaysRun::Labels(vec![label]),
            AlwaysRunRepr::Labels(labels) => AlwaysRun::Labels(labels),
        }
    }
}

impl From<AlwaysRun> for AlwaysRunRepr {
    fn from(policy: AlwaysRun) -> Self {
        match policy {
            AlwaysRun::Never => AlwaysRunRepr::Flag(false),
            AlwaysRun::Always => AlwaysRunRepr::Flag(true),
            AlwaysRun::Labels(labels) => AlwaysRunRepr::Labels(labels),
        }
    }
}

/// Everything a `KnowledgeClient` and `HandlerWrapper` need to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KnowledgeConfig {
    /// Base URL of the knowledge service.
    pub base_url: String,

    /// Bearer token sent to the knowledge service, if any.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub intelligence_level: IntelligenceLevel,

    /// When false, `teach` is refused locally and nothing is ever sent.
    pub learning_enabled: bool,

    pub always_run: AlwaysRun,

    /// Upper bound for every call to the service.
    pub timeout_ms: u64,

    pub batch_max_size: usize,
    pub batch_max_wait_ms: u64,

    pub circuit_failure_threshold: u32,
    pub circuit_reset_timeout_ms: u64,
    pub circuit_success_threshold: u32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            intelligence_level: IntelligenceLevel::default(),
            learning_enabled: true,
            always_run: AlwaysRun::Never,
            timeout_ms: 500,
            batch_max_size: 10,
            batch_max_wait_ms: 50,
            circuit_failure_threshold: 3,
            circuit_reset_timeout_ms: 30_000,
            circuit_success_threshold: 1,
        }
    }
}

impl KnowledgeConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(format!("Invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `MNEME_*` environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        Self::default().merge_env()
    }

    /// Overlay `MNEME_*` environment variables on this config.
    ///
    /// - `MNEME_BASE_URL`, `MNEME_API_KEY`
    /// - `MNEME_INTELLIGENCE_LEVEL` (`low` | `medium` | `high`)
    /// - `MNEME_LEARNING_ENABLED` (`true` | `false`)
    /// - `MNEME_ALWAYS_RUN` (`true` | `false` | comma-separated labels)
    /// - `MNEME_TIMEOUT_MS`, `MNEME_BATCH_MAX_SIZE`, `MNEME_BATCH_MAX_WAIT_MS`
    /// - `MNEME_CIRCUIT_FAILURE_THRESHOLD`, `MNEME_CIRCUIT_RESET_TIMEOUT_MS`,
    ///   `MNEME_CIRCUIT_SUCCESS_THRESHOLD`
    pub fn merge_env(self) -> Result<Self, AppError> {
        self.merge_vars(|name| std::env::var(name).ok())
    }

    fn merge_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        if let Some(raw) = lookup("MNEME_BASE_URL") {
            self.base_url = raw;
        }
        if let Some(raw) = lookup("MNEME_API_KEY") {
            self.api_key = Some(raw).filter(|k| !k.is_empty());
        }
        if let Some(raw) = lookup("MNEME_INTELLIGENCE_LEVEL") {
            self.intelligence_level = parse_var("MNEME_INTELLIGENCE_LEVEL", &raw)?;
        }
        if let Some(raw) = lookup("MNEME_LEARNING_ENABLED") {
            self.learning_enabled = parse_bool("MNEME_LEARNING_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("MNEME_ALWAYS_RUN") {
            self.always_run = parse_var("MNEME_ALWAYS_RUN", &raw)?;
        }
        if let Some(raw) = lookup("MNEME_TIMEOUT_MS") {
            self.timeout_ms = parse_var("MNEME_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("MNEME_BATCH_MAX_SIZE") {
            self.batch_max_size = parse_var("MNEME_BATCH_MAX_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("MNEME_BATCH_MAX_WAIT_MS") {
            self.batch_max_wait_ms = parse_var("MNEME_BATCH_MAX_WAIT_MS", &raw)?;
        }
        if let Some(raw) = lookup("MNEME_CIRCUIT_FAILURE_THRESHOLD") {
            self.circuit_failure_threshold = parse_var("MNEME_CIRCUIT_FAILURE_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("MNEME_CIRCUIT_RESET_TIMEOUT_MS") {
            self.circuit_reset_timeout_ms = parse_var("MNEME_CIRCUIT_RESET_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("MNEME_CIRCUIT_SUCCESS_THRESHOLD") {
            self.circuit_success_threshold = parse_var("MNEME_CIRCUIT_SUCCESS_THRESHOLD", &raw)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        Url::parse(&self.base_url).map_err(|e| {
            AppError::ConfigError(format!("Invalid base URL '{}': {e}", self.base_url))
        })?;
        if self.timeout_ms == 0 {
            return Err(AppError::ConfigError("timeoutMs must be at least 1".into()));
        }
        if self.batch_max_size == 0 {
            return Err(AppError::ConfigError("batchMaxSize must be at least 1".into()));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "circuitFailureThreshold must be at least 1".into(),
            ));
        }
        if self.circuit_success_threshold == 0 {
            return Err(AppError::ConfigError(
                "circuitSuccessThreshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_size: self.batch_max_size,
            max_wait: Duration::from_millis(self.batch_max_wait_ms),
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: self.circuit_success_threshold,
            recovery_timeout: Duration::from_millis(self.circuit_reset_timeout_ms),
            ..Default::default()
        }
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| AppError::ConfigError(format!("Invalid {name} '{raw}': {e}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, AppError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AppError::ConfigError(format!(
            "Invalid {name} '{raw}': expected true or false"
        ))),
    }
}
