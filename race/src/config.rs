//! Configuration management for racetrack.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Per-category overrides come from an optional JSON file and are merged into
//! a flat [`CategoryConfig`] once, when a session is opened.

use crate::types::{CategoryId, RaceMode};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The category overrides file could not be read
    #[error("Failed to read category overrides {path}: {source}")]
    Read {
        /// File that was requested
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The category overrides file is not valid JSON for [`CategoryOverrides`]
    #[error("Invalid category overrides: {0}")]
    Parse(#[from] serde_json::Error),

    /// A resolved value is unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How member ratings combine into a co-op team's pre-race score
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAggregation {
    /// Arithmetic mean
    #[default]
    Mean,
    /// Strongest member
    Max,
    /// Weakest member
    Min,
    /// Weighted mean over ratings sorted strongest first; missing weights are 1
    Weighted(Vec<f64>),
    /// Arbitrary function over member ratings
    #[serde(skip)]
    Custom(Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>),
}

impl ScoreAggregation {
    /// Combine `scores` into one team score
    ///
    /// Returns `None` for an empty slice.
    #[must_use]
    pub fn aggregate(&self, scores: &[f64]) -> Option<f64> {
        if scores.is_empty() {
            return None;
        }

        let value = match self {
            Self::Mean => {
                // Team sizes are tiny; precision loss is irrelevant
                #[allow(clippy::cast_precision_loss)]
                let len = scores.len() as f64;
                scores.iter().sum::<f64>() / len
            },
            Self::Max => scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Min => scores.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Weighted(weights) => {
                let mut sorted = scores.to_vec();
                sorted.sort_by(|a, b| b.total_cmp(a));
                let (mut total, mut norm) = (0.0, 0.0);
                for (i, score) in sorted.iter().enumerate() {
                    let weight = weights.get(i).copied().unwrap_or(1.0);
                    total += weight * score;
                    norm += weight;
                }
                if norm == 0.0 {
                    return Self::Mean.aggregate(scores);
                }
                total / norm
            },
            Self::Custom(f) => f(scores),
        };
        Some(value)
    }
}

impl fmt::Debug for ScoreAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => f.write_str("Mean"),
            Self::Max => f.write_str("Max"),
            Self::Min => f.write_str("Min"),
            Self::Weighted(w) => f.debug_tuple("Weighted").field(w).finish(),
            Self::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// Elo-style rating parameters
#[derive(Debug, Clone)]
pub struct EloConfig {
    /// Rating exchanged in a decisive head-to-head
    pub max_gain: f64,
    /// Base of the expectation exponent
    pub base: f64,
    /// Rating difference that scales the exponent by one
    pub dividend: f64,
    /// Rating of an entrant with no history in the category
    pub starting_score: f64,
    /// Co-op team score
    pub aggregation: ScoreAggregation,
}

impl Default for EloConfig {
    fn default() -> Self {
        Self {
            max_gain: 32.0,
            base: 10.0,
            dividend: 400.0,
            starting_score: 1500.0,
            aggregation: ScoreAggregation::Mean,
        }
    }
}

/// Fully resolved settings for one category
#[derive(Debug, Clone)]
pub struct CategoryConfig {
    /// Time from "everyone ready" to the start
    pub countdown: Duration,
    /// Seconds-remaining marks announced during the countdown
    pub countdown_ticks: Vec<u64>,
    /// Grace period after everyone is done before results are recorded
    pub banking: Duration,
    /// Largest allowed co-op team
    pub max_team_size: usize,
    /// Announce who picks the next level in series mode
    pub picker_rotation: bool,
    /// Full game or level series
    pub mode: RaceMode,
    /// Rating parameters
    pub elo: EloConfig,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(10),
            countdown_ticks: vec![5, 4, 3, 2, 1],
            banking: Duration::from_secs(30),
            max_team_size: 4,
            picker_rotation: false,
            mode: RaceMode::FullGame,
            elo: EloConfig::default(),
        }
    }
}

impl CategoryConfig {
    /// Banking period that applies after a race completes
    ///
    /// Series races advance without a banking period.
    #[must_use]
    pub const fn banking_period(&self) -> Duration {
        match self.mode {
            RaceMode::Series => Duration::ZERO,
            RaceMode::FullGame => self.banking,
        }
    }

    /// Countdown ticks strictly inside the countdown window, largest first
    #[must_use]
    pub fn active_ticks(&self) -> Vec<u64> {
        let mut ticks: Vec<u64> = self
            .countdown_ticks
            .iter()
            .copied()
            .filter(|t| *t > 0 && Duration::from_secs(*t) < self.countdown)
            .collect();
        ticks.sort_unstable_by(|a, b| b.cmp(a));
        ticks.dedup();
        ticks
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_team_size == 0 {
            return Err(ConfigError::Invalid("max_team_size must be at least 1".into()));
        }
        let elo = &self.elo;
        if !(elo.base > 0.0 && elo.dividend > 0.0 && elo.max_gain.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "elo parameters out of range: base={}, dividend={}, max_gain={}",
                elo.base, elo.dividend, elo.max_gain
            )));
        }
        Ok(())
    }
}

/// Partial Elo settings from the overrides file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EloOverrides {
    /// See [`EloConfig::max_gain`]
    pub max_gain: Option<f64>,
    /// See [`EloConfig::base`]
    pub base: Option<f64>,
    /// See [`EloConfig::dividend`]
    pub dividend: Option<f64>,
    /// See [`EloConfig::starting_score`]
    pub starting_score: Option<f64>,
    /// See [`EloConfig::aggregation`]
    pub aggregation: Option<ScoreAggregation>,
}

/// Partial settings for one category; unset fields fall back to the defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryOverrides {
    /// Countdown length in seconds
    pub countdown_secs: Option<u64>,
    /// Seconds-remaining marks
    pub countdown_ticks: Option<Vec<u64>>,
    /// Banking period in seconds
    pub banking_secs: Option<u64>,
    /// Largest co-op team
    pub max_team_size: Option<usize>,
    /// Next-picker announcements
    pub picker_rotation: Option<bool>,
    /// Full game or series
    pub mode: Option<RaceMode>,
    /// Rating parameters
    #[serde(default)]
    pub elo: EloOverrides,
}

impl CategoryOverrides {
    /// Apply these overrides on top of `base`
    #[must_use]
    pub fn merge_onto(&self, base: &CategoryConfig) -> CategoryConfig {
        let elo = &self.elo;
        CategoryConfig {
            countdown: self.countdown_secs.map_or(base.countdown, Duration::from_secs),
            countdown_ticks: self
                .countdown_ticks
                .clone()
                .unwrap_or_else(|| base.countdown_ticks.clone()),
            banking: self.banking_secs.map_or(base.banking, Duration::from_secs),
            max_team_size: self.max_team_size.unwrap_or(base.max_team_size),
            picker_rotation: self.picker_rotation.unwrap_or(base.picker_rotation),
            mode: self.mode.unwrap_or(base.mode),
            elo: EloConfig {
                max_gain: elo.max_gain.unwrap_or(base.elo.max_gain),
                base: elo.base.unwrap_or(base.elo.base),
                dividend: elo.dividend.unwrap_or(base.elo.dividend),
                starting_score: elo.starting_score.unwrap_or(base.elo.starting_score),
                aggregation: elo
                    .aggregation
                    .clone()
                    .unwrap_or_else(|| base.elo.aggregation.clone()),
            },
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct RaceConfig {
    /// Settings for categories without overrides
    pub defaults: CategoryConfig,
    /// Per-category overrides
    pub categories: HashMap<CategoryId, CategoryOverrides>,
    /// `PostgreSQL` URL; the in-memory result store is used when unset
    pub database_url: Option<String>,
    /// Prometheus scrape address; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
    /// How long shutdown waits for pending effects
    pub shutdown_timeout: Duration,
}

impl RaceConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `RACE_CATEGORIES_FILE` cannot be read or
    /// parsed, or a resolved category is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`RaceConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(default, Duration::from_secs)
        };

        let base = CategoryConfig::default();
        let defaults = CategoryConfig {
            countdown: secs("RACE_COUNTDOWN_SECS", base.countdown),
            countdown_ticks: lookup("RACE_COUNTDOWN_TICKS")
                .map(|v| {
                    v.split(',')
                        .filter_map(|t| t.trim().parse().ok())
                        .collect()
                })
                .unwrap_or(base.countdown_ticks),
            banking: secs("RACE_BANKING_SECS", base.banking),
            max_team_size: lookup("RACE_MAX_TEAM_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(base.max_team_size),
            picker_rotation: lookup("RACE_PICKER_ROTATION")
                .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes")),
            mode: base.mode,
            elo: EloConfig {
                max_gain: parsed("RACE_ELO_MAX_GAIN").unwrap_or(base.elo.max_gain),
                base: parsed("RACE_ELO_BASE").unwrap_or(base.elo.base),
                dividend: parsed("RACE_ELO_DIVIDEND").unwrap_or(base.elo.dividend),
                starting_score: parsed("RACE_ELO_STARTING_SCORE")
                    .unwrap_or(base.elo.starting_score),
                aggregation: base.elo.aggregation,
            },
        };

        let categories = match lookup("RACE_CATEGORIES_FILE") {
            Some(path) => load_overrides(Path::new(&path))?,
            None => HashMap::new(),
        };

        let config = Self {
            defaults,
            categories,
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
            metrics_addr: lookup("METRICS_ADDR").and_then(|v| v.parse().ok()),
            shutdown_timeout: secs("RACE_SHUTDOWN_TIMEOUT_SECS", Duration::from_secs(30)),
        };

        config.defaults.validate()?;
        for category in config.categories.keys() {
            config.category(category).validate()?;
        }

        Ok(config)
    }

    /// Resolved settings for `category`
    #[must_use]
    pub fn category(&self, category: &CategoryId) -> CategoryConfig {
        self.categories
            .get(category)
            .map_or_else(|| self.defaults.clone(), |o| o.merge_onto(&self.defaults))
    }
}

/// Parse a JSON object of category name → [`CategoryOverrides`]
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] on malformed input.
pub fn parse_overrides(json: &str) -> Result<HashMap<CategoryId, CategoryOverrides>, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

fn load_overrides(path: &Path) -> Result<HashMap<CategoryId, CategoryOverrides>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_overrides(&text)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = RaceConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.defaults.countdown, Duration::from_secs(10));
        assert_eq!(config.defaults.banking, Duration::from_secs(30));
        assert_eq!(config.defaults.elo.max_gain, 32.0);
        assert_eq!(config.defaults.elo.starting_score, 1500.0);
        assert!(config.database_url.is_none());
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = RaceConfig::from_lookup(lookup(&[
            ("RACE_COUNTDOWN_SECS", "15"),
            ("RACE_COUNTDOWN_TICKS", "10, 3,2,1"),
            ("RACE_MAX_TEAM_SIZE", "2"),
            ("RACE_ELO_MAX_GAIN", "24"),
            ("RACE_PICKER_ROTATION", "true"),
            ("METRICS_ADDR", "127.0.0.1:9000"),
            ("RACE_BANKING_SECS", "not a number"),
        ]))
        .unwrap();

        assert_eq!(config.defaults.countdown, Duration::from_secs(15));
        assert_eq!(config.defaults.countdown_ticks, vec![10, 3, 2, 1]);
        assert_eq!(config.defaults.max_team_size, 2);
        assert_eq!(config.defaults.elo.max_gain, 24.0);
        assert!(config.defaults.picker_rotation);
        assert_eq!(config.defaults.banking, Duration::from_secs(30));
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn category_overrides_merge_onto_defaults() {
        let overrides = parse_overrides(
            r#"{
                "ils": { "mode": "series", "picker_rotation": true, "elo": { "max_gain": 16 } },
                "coop": { "max_team_size": 2, "elo": { "aggregation": { "weighted": [2.0, 1.0] } } }
            }"#,
        )
        .unwrap();
        let config = RaceConfig {
            categories: overrides,
            ..RaceConfig::default()
        };

        let ils = config.category(&CategoryId::new("ils"));
        assert_eq!(ils.mode, RaceMode::Series);
        assert!(ils.picker_rotation);
        assert_eq!(ils.elo.max_gain, 16.0);
        assert_eq!(ils.elo.dividend, 400.0);
        assert_eq!(ils.banking_period(), Duration::ZERO);

        let coop = config.category(&CategoryId::new("coop"));
        assert_eq!(coop.max_team_size, 2);
        assert_eq!(coop.elo.aggregation.aggregate(&[1000.0, 1600.0]), Some(1400.0));

        let other = config.category(&CategoryId::new("any%"));
        assert_eq!(other.max_team_size, 4);
        assert_eq!(other.banking_period(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_override_fields_are_rejected() {
        assert!(parse_overrides(r#"{ "x": { "countdown": 5 } }"#).is_err());
    }

    #[test]
    fn zero_team_size_is_invalid() {
        let result = RaceConfig::from_lookup(lookup(&[("RACE_MAX_TEAM_SIZE", "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn aggregations() {
        let scores = [1400.0, 1600.0, 1500.0];
        assert_eq!(ScoreAggregation::Mean.aggregate(&scores), Some(1500.0));
        assert_eq!(ScoreAggregation::Max.aggregate(&scores), Some(1600.0));
        assert_eq!(ScoreAggregation::Min.aggregate(&scores), Some(1400.0));
        assert_eq!(ScoreAggregation::Mean.aggregate(&[]), None);

        let strongest = ScoreAggregation::Custom(Arc::new(|s: &[f64]| s[0] * 2.0));
        assert_eq!(strongest.aggregate(&[10.0]), Some(20.0));
    }

    #[test]
    fn ticks_outside_window_are_dropped() {
        let config = CategoryConfig {
            countdown: Duration::from_secs(5),
            countdown_ticks: vec![1, 10, 3, 5, 3, 0],
            ..CategoryConfig::default()
        };
        assert_eq!(config.active_ticks(), vec![3, 1]);
    }
}
