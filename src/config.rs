use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub reldisco: ReldiscoConfig,
    #[serde(default)]
    pub heuristics: HeuristicsConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Storage and logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReldiscoConfig {
    /// SQLite file holding relation candidates and run state.
    pub db_path: PathBuf,
    /// SQLite file backing the reference graph store. Defaults to `db_path`.
    #[serde(default)]
    pub graph_db_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Heuristics pass configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HeuristicsConfig {
    #[serde(default = "default_max_concurrent_processing")]
    pub max_concurrent_processing: usize,
    /// Number of example value pairs kept per candidate (first N observed).
    #[serde(default = "default_example_match_limit")]
    pub example_match_limit: usize,
    /// Identity-key search hits requested per property value.
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_processing: default_max_concurrent_processing(),
            example_match_limit: default_example_match_limit(),
            max_search_results: default_max_search_results(),
        }
    }
}

/// Evaluation policy and pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_min_count_for_eval")]
    pub min_count_for_eval: u64,
    /// Relative growth of `count` since the last evaluation needed to re-score.
    #[serde(default = "default_percent_change_for_eval")]
    pub percent_change_for_eval: f64,
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,
    #[serde(default = "default_rejection_threshold")]
    pub rejection_threshold: f64,
    #[serde(default = "default_max_concurrent_evaluation")]
    pub max_concurrent_evaluation: usize,
    /// Sibling candidates summarised in each oracle prompt.
    #[serde(default = "default_sibling_limit")]
    pub sibling_limit: usize,
    /// Matching value pairs fetched from the graph store per prompt.
    #[serde(default = "default_example_value_limit")]
    pub example_value_limit: usize,
    #[serde(default = "default_stats_cache_capacity")]
    pub stats_cache_capacity: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            min_count_for_eval: default_min_count_for_eval(),
            percent_change_for_eval: default_percent_change_for_eval(),
            acceptance_threshold: default_acceptance_threshold(),
            rejection_threshold: default_rejection_threshold(),
            max_concurrent_evaluation: default_max_concurrent_evaluation(),
            sibling_limit: default_sibling_limit(),
            example_value_limit: default_example_value_limit(),
            stats_cache_capacity: default_stats_cache_capacity(),
        }
    }
}

/// Confidence oracle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// `openai` (any OpenAI-compatible chat endpoint) or `heuristic`.
    #[serde(default = "default_oracle_provider")]
    pub provider: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    #[serde(default = "default_oracle_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_oracle_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_oracle_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_oracle_provider(),
            model: default_oracle_model(),
            api_key_env: default_oracle_api_key_env(),
            endpoint: default_oracle_endpoint(),
            max_retries: default_oracle_max_retries(),
            timeout_secs: default_oracle_timeout_secs(),
        }
    }
}

/// Periodic full-pass scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_concurrent_processing() -> usize {
    50
}

fn default_example_match_limit() -> usize {
    5
}

fn default_max_search_results() -> usize {
    50
}

fn default_min_count_for_eval() -> u64 {
    3
}

fn default_percent_change_for_eval() -> f64 {
    0.15
}

fn default_acceptance_threshold() -> f64 {
    0.75
}

fn default_rejection_threshold() -> f64 {
    0.3
}

fn default_max_concurrent_evaluation() -> usize {
    5
}

fn default_sibling_limit() -> usize {
    10
}

fn default_example_value_limit() -> usize {
    10
}

fn default_stats_cache_capacity() -> usize {
    256
}

fn default_oracle_provider() -> String {
    "heuristic".to_string()
}

fn default_oracle_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_oracle_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_oracle_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_oracle_max_retries() -> usize {
    3
}

fn default_oracle_timeout_secs() -> u64 {
    60
}

fn default_interval_secs() -> u64 {
    3600
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in RELDISCO_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("RELDISCO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.heuristics.max_concurrent_processing == 0 {
            anyhow::bail!("heuristics.max_concurrent_processing must be greater than 0");
        }

        if self.heuristics.max_search_results == 0 {
            anyhow::bail!("heuristics.max_search_results must be greater than 0");
        }

        let eval = &self.evaluation;
        if eval.max_concurrent_evaluation == 0 {
            anyhow::bail!("evaluation.max_concurrent_evaluation must be greater than 0");
        }

        for (name, value) in [
            ("acceptance_threshold", eval.acceptance_threshold),
            ("rejection_threshold", eval.rejection_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("evaluation.{} must be between 0.0 and 1.0", name);
            }
        }

        if eval.rejection_threshold >= eval.acceptance_threshold {
            anyhow::bail!(
                "evaluation.rejection_threshold ({}) must be below acceptance_threshold ({})",
                eval.rejection_threshold,
                eval.acceptance_threshold
            );
        }

        if eval.percent_change_for_eval < 0.0 || eval.percent_change_for_eval.is_nan() {
            anyhow::bail!("evaluation.percent_change_for_eval must not be negative");
        }

        match self.oracle.provider.as_str() {
            "heuristic" => {}
            "openai" => {
                url::Url::parse(&self.oracle.endpoint).with_context(|| {
                    format!("oracle.endpoint is not a valid URL: {}", self.oracle.endpoint)
                })?;
                std::env::var(&self.oracle.api_key_env).with_context(|| {
                    format!(
                        "Environment variable {} not set. Set it in your .env file or as an environment variable with your oracle API key.",
                        self.oracle.api_key_env
                    )
                })?;
            }
            other => anyhow::bail!("Unknown oracle.provider: {} (expected openai or heuristic)", other),
        }

        if self.scheduler.enabled && self.scheduler.interval_secs == 0 {
            anyhow::bail!("scheduler.interval_secs must be greater than 0 when enabled");
        }

        Ok(())
    }

    /// Get candidate database path
    pub fn db_path(&self) -> &Path {
        &self.reldisco.db_path
    }

    /// Get graph store database path
    pub fn graph_db_path(&self) -> &Path {
        self.reldisco
            .graph_db_path
            .as_deref()
            .unwrap_or(&self.reldisco.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const MINIMAL: &str = r#"
[reldisco]
db_path = "./test.db"
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.reldisco.log_level, "info");
        assert_eq!(config.heuristics.max_concurrent_processing, 50);
        assert_eq!(config.heuristics.example_match_limit, 5);
        assert_eq!(config.evaluation.min_count_for_eval, 3);
        assert!((config.evaluation.acceptance_threshold - 0.75).abs() < 1e-9);
        assert_eq!(config.evaluation.max_concurrent_evaluation, 5);
        assert_eq!(config.oracle.provider, "heuristic");
        assert!(!config.scheduler.enabled);
        assert_eq!(config.graph_db_path(), Path::new("./test.db"));
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[reldisco]
db_path = "./candidates.db"
graph_db_path = "./graph.db"
log_level = "debug"

[heuristics]
max_concurrent_processing = 120
example_match_limit = 3

[evaluation]
min_count_for_eval = 1
percent_change_for_eval = 0.2
acceptance_threshold = 0.8
rejection_threshold = 0.2
max_concurrent_evaluation = 8

[scheduler]
enabled = true
interval_secs = 600
"#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.reldisco.log_level, "debug");
        assert_eq!(config.graph_db_path(), Path::new("./graph.db"));
        assert_eq!(config.heuristics.max_concurrent_processing, 120);
        assert_eq!(config.evaluation.min_count_for_eval, 1);
        assert_eq!(config.scheduler.interval(), Duration::from_secs(600));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let toml = r#"
[reldisco]
db_path = "./test.db"

[evaluation]
acceptance_threshold = 0.5
rejection_threshold = 0.5
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("rejection_threshold"));
    }

    #[test]
    fn test_threshold_range_checked() {
        let toml = r#"
[reldisco]
db_path = "./test.db"

[evaluation]
acceptance_threshold = 1.5
"#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let toml = r#"
[reldisco]
db_path = "./test.db"

[evaluation]
max_concurrent_evaluation = 0
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_evaluation"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let toml = r#"
[reldisco]
db_path = "./test.db"

[oracle]
provider = "carrier-pigeon"
"#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_openai_provider_requires_api_key() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let toml = r#"
[reldisco]
db_path = "./test.db"

[oracle]
provider = "openai"
api_key_env = "RELDISCO_TEST_ORACLE_KEY"
"#;
        std::env::remove_var("RELDISCO_TEST_ORACLE_KEY");
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("RELDISCO_TEST_ORACLE_KEY"));

        std::env::set_var("RELDISCO_TEST_ORACLE_KEY", "test-key");
        assert!(Config::from_toml_str(toml).is_ok());
        std::env::remove_var("RELDISCO_TEST_ORACLE_KEY");
    }

    #[test]
    fn test_config_load_from_env_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, MINIMAL).unwrap();

        let original = std::env::var("RELDISCO_CONFIG").ok();
        std::env::set_var("RELDISCO_CONFIG", config_path.to_str().unwrap());
        let config = Config::load();
        std::env::remove_var("RELDISCO_CONFIG");
        if let Some(v) = original {
            std::env::set_var("RELDISCO_CONFIG", v);
        }

        let config = config.unwrap();
        assert_eq!(config.db_path(), Path::new("./test.db"));
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("RELDISCO_CONFIG").ok();
        std::env::set_var("RELDISCO_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("RELDISCO_CONFIG");
        if let Some(v) = original {
            std::env::set_var("RELDISCO_CONFIG", v);
        }
    }
}
