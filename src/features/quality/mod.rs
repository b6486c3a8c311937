//! # Quality Gate
//!
//! Scores a generated image against its prompt using an external vision model.
//! A gate that cannot produce a score does not block the workflow: it returns
//! the outcome dictated by [`GateFailurePolicy`], flagged as `defaulted`.
//!
//! - **Version**: 1.1.0
//! - **Since**: 0.3.0
//! - **Toggleable**: true
//!
//! ## Changelog
//! - 1.1.0: Configurable gate failure policy, inclusive threshold
//! - 1.0.0: Initial release with Gemini Vision scoring

pub mod gemini;

#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

use crate::core::GateFailurePolicy;
use crate::features::models::Artifact;

pub use gemini::GeminiVisionGate;

/// USD charged per validation call
pub const VALIDATION_COST: f64 = 0.001;

/// Feedback is cut to this many characters when taken from free text
const FEEDBACK_LIMIT: usize = 200;

/// Result of one validation call
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// Always within [0, 1]
    pub score: f64,
    pub passed: bool,
    pub feedback: String,
    pub cost: f64,
    /// The gate failed and the outcome came from the failure policy
    pub defaulted: bool,
}

impl ValidationOutcome {
    /// Outcome for a real score; the threshold is inclusive
    pub fn scored(score: f64, threshold: f64, feedback: impl Into<String>, cost: f64) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Self {
            score,
            passed: score >= threshold,
            feedback: feedback.into(),
            cost,
            defaulted: false,
        }
    }

    /// Outcome when the gate itself failed
    pub fn gate_failure(
        policy: GateFailurePolicy,
        threshold: f64,
        reason: &str,
        cost: f64,
    ) -> Self {
        match policy {
            GateFailurePolicy::PassAtThreshold => Self {
                score: threshold,
                passed: true,
                feedback: format!("Validation error (defaulting to pass): {reason}"),
                cost,
                defaulted: true,
            },
            GateFailurePolicy::Fail => Self {
                score: 0.0,
                passed: false,
                feedback: format!("Validation error (treated as failure): {reason}"),
                cost,
                defaulted: true,
            },
        }
    }
}

/// Contract for the external vision validator
#[async_trait]
pub trait QualityGate: Send + Sync {
    /// Inclusive pass threshold
    fn min_score(&self) -> f64;

    /// Validate once; never retries and never errors
    async fn validate(&self, artifact: &Artifact, prompt: &str) -> ValidationOutcome;
}

fn score_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?i)score["']?\s*[:=]?\s*([0-9]*\.?[0-9]+)"#).ok())
        .as_ref()
}

/// Extract `(score, feedback)` from a vision model reply.
///
/// Accepts a JSON object (bare or inside a fenced block) with `score` and
/// optional `issues`, then falls back to the first `score: N` in free text.
pub fn parse_score_response(text: &str) -> Option<(f64, String)> {
    let trimmed = text.trim();
    let json_slice = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&trimmed[start..=end]),
        _ => None,
    };

    let parsed = json_slice.and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());
    if let Some(value) = parsed {
        if let Some(score) = value.get("score").and_then(score_value) {
            let issues: Vec<String> = value
                .get("issues")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let feedback = if issues.is_empty() {
                "No issues identified".to_string()
            } else {
                issues.join(", ")
            };
            return Some((score, feedback));
        }
    }

    let captures = score_pattern()?.captures(trimmed)?;
    let score = captures.get(1)?.as_str().parse::<f64>().ok()?;
    Some((score, trimmed.chars().take(FEEDBACK_LIMIT).collect()))
}

fn score_value(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}
