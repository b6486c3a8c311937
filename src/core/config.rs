//! # Configuration
//!
//! Environment-driven settings for providers, retry policy, quality gating and
//! output locations, with an optional YAML overlay for the non-secret options.
//!
//! - **Version**: 1.1.0
//! - **Since**: 0.1.0
//!
//! ## Changelog
//! - 1.1.0: YAML overlay, attempt budget and gate failure policy
//! - 1.0.0: Initial release with environment loading

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::HeroError;

/// Named size presets offered to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePreset {
    Small,
    Medium,
    Large,
}

impl SizePreset {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "small" => Some(SizePreset::Small),
            "medium" => Some(SizePreset::Medium),
            "large" => Some(SizePreset::Large),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizePreset::Small => "small",
            SizePreset::Medium => "medium",
            SizePreset::Large => "large",
        }
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse `WIDTHxHEIGHT`
    pub fn parse(s: &str) -> Option<Self> {
        let (w, h) = s.trim().split_once(['x', 'X'])?;
        let width = w.trim().parse::<u32>().ok()?;
        let height = h.trim().parse::<u32>().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How retry delays grow between transient failures on one model
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// What the quality gate reports when it cannot produce a score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateFailurePolicy {
    /// Pass at exactly the minimum threshold, flagged as defaulted
    PassAtThreshold,
    /// Fail with a zero score
    Fail,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub replicate_api_token: String,
    pub gcp_project_id: String,
    pub gcp_location: String,
    pub gcp_access_token: Option<String>,
    pub default_model: String,
    pub fallback_model: String,
    pub enable_quality_check: bool,
    pub min_quality_score: f64,
    pub size_small: ImageSize,
    pub size_medium: ImageSize,
    pub size_large: ImageSize,
    pub output_directory: PathBuf,
    pub failed_output_directory: PathBuf,
    pub save_failed_generations: bool,
    pub staging_directory: PathBuf,
    pub log_costs: bool,
    pub cost_log_file: PathBuf,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub retry_backoff: BackoffStrategy,
    pub max_total_attempts: u32,
    pub gate_failure_policy: GateFailurePolicy,
    pub request_timeout_seconds: u64,
    pub log_level: String,
}

/// Non-secret options that a YAML file may override
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverlay {
    pub default_model: Option<String>,
    pub fallback_model: Option<String>,
    pub enable_quality_check: Option<bool>,
    pub min_quality_score: Option<f64>,
    pub size_small: Option<String>,
    pub size_medium: Option<String>,
    pub size_large: Option<String>,
    pub output_directory: Option<PathBuf>,
    pub failed_output_directory: Option<PathBuf>,
    pub save_failed_generations: Option<bool>,
    pub staging_directory: Option<PathBuf>,
    pub log_costs: Option<bool>,
    pub cost_log_file: Option<PathBuf>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub retry_backoff: Option<String>,
    pub max_total_attempts: Option<u32>,
    pub quality_gate_failure_policy: Option<String>,
    pub request_timeout_seconds: Option<u64>,
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, HeroError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HeroError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let replicate_api_token = get("REPLICATE_API_TOKEN").ok_or_else(|| {
            HeroError::Configuration(
                "REPLICATE_API_TOKEN environment variable is required. \
                 Get your token at https://replicate.com/account/api-tokens"
                    .to_string(),
            )
        })?;

        let gcp_project_id = get("GCP_PROJECT_ID").ok_or_else(|| {
            HeroError::Configuration(
                "GCP_PROJECT_ID environment variable is required. \
                 Create a project at https://console.cloud.google.com"
                    .to_string(),
            )
        })?;

        let config = Config {
            replicate_api_token,
            gcp_project_id,
            gcp_location: get("GCP_LOCATION").unwrap_or_else(|| "us-central1".to_string()),
            gcp_access_token: get("GCP_ACCESS_TOKEN"),
            default_model: get("DEFAULT_MODEL").unwrap_or_else(|| "flux-pro".to_string()),
            fallback_model: get("FALLBACK_MODEL").unwrap_or_else(|| "imagen".to_string()),
            enable_quality_check: parse_bool(
                "ENABLE_QUALITY_CHECK",
                get("ENABLE_QUALITY_CHECK"),
                true,
            )?,
            min_quality_score: parse_score("MIN_QUALITY_SCORE", get("MIN_QUALITY_SCORE"))?,
            size_small: parse_size_var("SIZE_SMALL", get("SIZE_SMALL"), ImageSize::new(800, 450))?,
            size_medium: parse_size_var(
                "SIZE_MEDIUM",
                get("SIZE_MEDIUM"),
                ImageSize::new(1920, 1080),
            )?,
            size_large: parse_size_var(
                "SIZE_LARGE",
                get("SIZE_LARGE"),
                ImageSize::new(2560, 1440),
            )?,
            output_directory: get("OUTPUT_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public/images")),
            failed_output_directory: get("FAILED_OUTPUT_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public/images/failed")),
            save_failed_generations: parse_bool(
                "SAVE_FAILED_GENERATIONS",
                get("SAVE_FAILED_GENERATIONS"),
                true,
            )?,
            staging_directory: get("STAGING_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("hero-image")),
            log_costs: parse_bool("LOG_COSTS", get("LOG_COSTS"), true)?,
            cost_log_file: get("COST_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("generation_costs.log")),
            max_retries: parse_number("MAX_RETRIES", get("MAX_RETRIES"), 2)?,
            retry_delay_seconds: parse_number(
                "RETRY_DELAY_SECONDS",
                get("RETRY_DELAY_SECONDS"),
                5,
            )?,
            retry_backoff: parse_backoff("RETRY_BACKOFF", get("RETRY_BACKOFF"))?,
            max_total_attempts: parse_number("MAX_TOTAL_ATTEMPTS", get("MAX_TOTAL_ATTEMPTS"), 6)?,
            gate_failure_policy: parse_gate_policy(
                "QUALITY_GATE_FAILURE_POLICY",
                get("QUALITY_GATE_FAILURE_POLICY"),
            )?,
            request_timeout_seconds: parse_number(
                "REQUEST_TIMEOUT_SECONDS",
                get("REQUEST_TIMEOUT_SECONDS"),
                120,
            )?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Apply a YAML overlay file on top of this configuration
    pub fn with_overlay_file(self, path: &Path) -> Result<Self, HeroError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HeroError::Configuration(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let overlay: ConfigOverlay = serde_yaml::from_str(&contents).map_err(|e| {
            HeroError::Configuration(format!("Invalid config file {}: {e}", path.display()))
        })?;
        self.with_overlay(overlay)
    }

    pub fn with_overlay(mut self, overlay: ConfigOverlay) -> Result<Self, HeroError> {
        if let Some(v) = overlay.default_model {
            self.default_model = v;
        }
        if let Some(v) = overlay.fallback_model {
            self.fallback_model = v;
        }
        if let Some(v) = overlay.enable_quality_check {
            self.enable_quality_check = v;
        }
        if let Some(v) = overlay.min_quality_score {
            self.min_quality_score = v;
        }
        if let Some(v) = overlay.size_small {
            self.size_small = parse_size_var("size_small", Some(v), self.size_small)?;
        }
        if let Some(v) = overlay.size_medium {
            self.size_medium = parse_size_var("size_medium", Some(v), self.size_medium)?;
        }
        if let Some(v) = overlay.size_large {
            self.size_large = parse_size_var("size_large", Some(v), self.size_large)?;
        }
        if let Some(v) = overlay.output_directory {
            self.output_directory = v;
        }
        if let Some(v) = overlay.failed_output_directory {
            self.failed_output_directory = v;
        }
        if let Some(v) = overlay.save_failed_generations {
            self.save_failed_generations = v;
        }
        if let Some(v) = overlay.staging_directory {
            self.staging_directory = v;
        }
        if let Some(v) = overlay.log_costs {
            self.log_costs = v;
        }
        if let Some(v) = overlay.cost_log_file {
            self.cost_log_file = v;
        }
        if let Some(v) = overlay.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = overlay.retry_delay_seconds {
            self.retry_delay_seconds = v;
        }
        if let Some(v) = overlay.retry_backoff {
            self.retry_backoff = parse_backoff("retry_backoff", Some(v))?;
        }
        if let Some(v) = overlay.max_total_attempts {
            self.max_total_attempts = v;
        }
        if let Some(v) = overlay.quality_gate_failure_policy {
            self.gate_failure_policy = parse_gate_policy("quality_gate_failure_policy", Some(v))?;
        }
        if let Some(v) = overlay.request_timeout_seconds {
            self.request_timeout_seconds = v;
        }
        if let Some(v) = overlay.log_level {
            self.log_level = v;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), HeroError> {
        if !(0.0..=1.0).contains(&self.min_quality_score) {
            return Err(HeroError::Configuration(format!(
                "MIN_QUALITY_SCORE must be between 0.0 and 1.0, got: {}",
                self.min_quality_score
            )));
        }
        if self.max_total_attempts == 0 {
            return Err(HeroError::Configuration(
                "MAX_TOTAL_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a preset to its configured dimensions
    pub fn size_for(&self, preset: SizePreset) -> ImageSize {
        match preset {
            SizePreset::Small => self.size_small,
            SizePreset::Medium => self.size_medium,
            SizePreset::Large => self.size_large,
        }
    }

    /// Accepts a preset name or an explicit `WxH`
    pub fn resolve_size(&self, value: &str) -> Option<ImageSize> {
        SizePreset::parse(value)
            .map(|p| self.size_for(p))
            .or_else(|| ImageSize::parse(value))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Path of the cost log, or None when cost logging is disabled
    pub fn cost_log_path(&self) -> Option<&Path> {
        self.log_costs.then_some(self.cost_log_file.as_path())
    }
}

fn parse_bool(name: &str, value: Option<String>, default: bool) -> Result<bool, HeroError> {
    match value {
        None => Ok(default),
        Some(v) => match v.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(HeroError::Configuration(format!(
                "{name} must be true or false, got: {v}"
            ))),
        },
    }
}

fn parse_number<T: std::str::FromStr>(
    name: &str,
    value: Option<String>,
    default: T,
) -> Result<T, HeroError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<T>().map_err(|_| {
            HeroError::Configuration(format!("{name} must be an integer, got: {v}"))
        }),
    }
}

fn parse_score(name: &str, value: Option<String>) -> Result<f64, HeroError> {
    match value {
        None => Ok(0.6),
        Some(v) => v
            .trim()
            .parse::<f64>()
            .map_err(|_| HeroError::Configuration(format!("{name} must be a number, got: {v}"))),
    }
}

fn parse_size_var(
    name: &str,
    value: Option<String>,
    default: ImageSize,
) -> Result<ImageSize, HeroError> {
    match value {
        None => Ok(default),
        Some(v) => ImageSize::parse(&v).ok_or_else(|| {
            HeroError::Configuration(format!(
                "Invalid size format for {name}: {v}. Expected format: WIDTHxHEIGHT"
            ))
        }),
    }
}

fn parse_backoff(name: &str, value: Option<String>) -> Result<BackoffStrategy, HeroError> {
    match value.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(BackoffStrategy::Fixed),
        Some(v) if v == "fixed" => Ok(BackoffStrategy::Fixed),
        Some(v) if v == "exponential" => Ok(BackoffStrategy::Exponential),
        Some(v) => Err(HeroError::Configuration(format!(
            "{name} must be 'fixed' or 'exponential', got: {v}"
        ))),
    }
}

fn parse_gate_policy(name: &str, value: Option<String>) -> Result<GateFailurePolicy, HeroError> {
    match value.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(GateFailurePolicy::PassAtThreshold),
        Some(v) if v == "pass" => Ok(GateFailurePolicy::PassAtThreshold),
        Some(v) if v == "fail" => Ok(GateFailurePolicy::Fail),
        Some(v) => Err(HeroError::Configuration(format!(
            "{name} must be 'pass' or 'fail', got: {v}"
        ))),
    }
}

#[cfg(test)]
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::from_lookup(|key| match key {
        "REPLICATE_API_TOKEN" => Some("test_token".to_string()),
        "GCP_PROJECT_ID" => Some("test_project".to_string()),
        "RETRY_DELAY_SECONDS" => Some("0".to_string()),
        _ => None,
    })
    .unwrap();
    config.output_directory = root.join("out");
    config.failed_output_directory = root.join("out/failed");
    config.staging_directory = root.join("staging");
    config.cost_log_file = root.join("costs.log");
    config
}
