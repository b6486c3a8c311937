//! Requests, attempt history and run reports produced by the orchestrator.

use chrono::{DateTime, Local};
use std::fmt;

use crate::core::ImageSize;
use crate::features::models::{Artifact, FailureReason};
use crate::features::quality::ValidationOutcome;

/// What the caller asked for. A new run always gets a new request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub size: ImageSize,
    /// Registry name of the primary model
    pub model: String,
    pub validate: bool,
}

/// States of one orchestration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    Attempt(String),
    Validate,
    RetryWait,
    SwitchModel,
    Done,
    Failed,
    NeedsManualReview,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Done
                | OrchestratorState::Failed
                | OrchestratorState::NeedsManualReview
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Init => write!(f, "INIT"),
            OrchestratorState::Attempt(model) => write!(f, "ATTEMPT({model})"),
            OrchestratorState::Validate => write!(f, "VALIDATE"),
            OrchestratorState::RetryWait => write!(f, "RETRY_WAIT"),
            OrchestratorState::SwitchModel => write!(f, "SWITCH_MODEL"),
            OrchestratorState::Done => write!(f, "DONE"),
            OrchestratorState::Failed => write!(f, "FAILED"),
            OrchestratorState::NeedsManualReview => write!(f, "NEEDS_MANUAL_REVIEW"),
        }
    }
}

/// Result of a single generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientFailure(FailureReason),
    PermanentFailure(FailureReason),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "success"),
            AttemptOutcome::TransientFailure(reason) => write!(f, "transient failure ({reason:?})"),
            AttemptOutcome::PermanentFailure(reason) => write!(f, "permanent failure ({reason:?})"),
        }
    }
}

/// One generation call. Created once and never changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// 1-based position across the whole run
    pub number: u32,
    pub model: String,
    pub outcome: AttemptOutcome,
    /// Generation cost charged for this call
    pub cost: f64,
    pub timestamp: DateTime<Local>,
    pub message: Option<String>,
}

/// A validation call tied to the attempt whose image it scored
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRecord {
    pub attempt: u32,
    pub model: String,
    pub outcome: ValidationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedReason {
    /// Primary and fallback both failed to generate
    ModelsExhausted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewReason {
    /// `max_total_attempts` reached before an acceptable image
    AttemptBudgetExhausted,
    /// Every available model produced images below the threshold
    QualityNotMet,
}

/// Terminal result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Failed(FailedReason),
    NeedsManualReview(ReviewReason),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Done => write!(f, "DONE"),
            RunOutcome::Failed(FailedReason::ModelsExhausted) => {
                write!(f, "FAILED (all models exhausted)")
            }
            RunOutcome::Failed(FailedReason::Cancelled) => write!(f, "FAILED (cancelled)"),
            RunOutcome::NeedsManualReview(ReviewReason::AttemptBudgetExhausted) => {
                write!(f, "NEEDS_MANUAL_REVIEW (attempt budget exhausted)")
            }
            RunOutcome::NeedsManualReview(ReviewReason::QualityNotMet) => {
                write!(f, "NEEDS_MANUAL_REVIEW (quality threshold not met)")
            }
        }
    }
}

/// Everything a run did, for the caller and for audit
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub request: GenerationRequest,
    pub outcome: RunOutcome,
    pub attempts: Vec<Attempt>,
    pub validations: Vec<ValidationRecord>,
    /// Accepted image on DONE, last image produced otherwise
    pub artifact: Option<Artifact>,
    /// Every state visited, in order
    pub trace: Vec<OrchestratorState>,
}

impl RunReport {
    pub fn is_done(&self) -> bool {
        self.outcome == RunOutcome::Done
    }

    pub fn manual_review_advised(&self) -> bool {
        matches!(self.outcome, RunOutcome::NeedsManualReview(_))
    }

    /// Generation plus validation cost of this run
    pub fn total_cost(&self) -> f64 {
        let generation: f64 = self.attempts.iter().map(|a| a.cost).sum();
        let validation: f64 = self.validations.iter().map(|v| v.outcome.cost).sum();
        generation + validation
    }

    pub fn attempts_on(&self, model: &str) -> usize {
        self.attempts.iter().filter(|a| a.model == model).count()
    }

    /// Human-readable history: every attempt with model, cost and outcome
    pub fn diagnostic_summary(&self) -> String {
        let mut lines = vec![format!("Run {}: {}", self.run_id, self.outcome)];

        for attempt in &self.attempts {
            let mut line = format!(
                "  #{} {} ${:.3} {}",
                attempt.number, attempt.model, attempt.cost, attempt.outcome
            );
            if let Some(message) = &attempt.message {
                line.push_str(&format!(": {message}"));
            }
            lines.push(line);

            for v in self.validations.iter().filter(|v| v.attempt == attempt.number) {
                lines.push(format!(
                    "     validation score {:.2} {} ${:.3}{} - {}",
                    v.outcome.score,
                    if v.outcome.passed { "PASS" } else { "FAIL" },
                    v.outcome.cost,
                    if v.outcome.defaulted { " (defaulted)" } else { "" },
                    v.outcome.feedback
                ));
            }
        }

        lines.push(format!("Total cost: ${:.3}", self.total_cost()));
        lines.push(format!(
            "Manual review advised: {}",
            if self.manual_review_advised() { "yes" } else { "no" }
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(number: u32, model: &str, outcome: AttemptOutcome, cost: f64) -> Attempt {
        Attempt {
            number,
            model: model.to_string(),
            outcome,
            cost,
            timestamp: Local::now(),
            message: None,
        }
    }

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: "run".to_string(),
            request: GenerationRequest {
                prompt: "p".to_string(),
                size: ImageSize::new(800, 450),
                model: "flux-pro".to_string(),
                validate: true,
            },
            outcome,
            attempts: vec![
                attempt(
                    1,
                    "flux-pro",
                    AttemptOutcome::TransientFailure(FailureReason::Timeout),
                    0.0,
                ),
                attempt(2, "imagen", AttemptOutcome::Success, 0.020),
            ],
            validations: vec![ValidationRecord {
                attempt: 2,
                model: "imagen".to_string(),
                outcome: ValidationOutcome::scored(0.45, 0.6, "off-topic", 0.001),
            }],
            artifact: None,
            trace: vec![OrchestratorState::Init],
        }
    }

    #[test]
    fn test_state_names() {
        assert_eq!(OrchestratorState::Attempt("imagen".into()).to_string(), "ATTEMPT(imagen)");
        assert_eq!(OrchestratorState::RetryWait.to_string(), "RETRY_WAIT");
        assert_eq!(OrchestratorState::NeedsManualReview.to_string(), "NEEDS_MANUAL_REVIEW");
        assert!(OrchestratorState::Failed.is_terminal());
        assert!(!OrchestratorState::SwitchModel.is_terminal());
    }

    #[test]
    fn test_total_cost_includes_validation() {
        let r = report(RunOutcome::Done);
        assert!((r.total_cost() - 0.021).abs() < 1e-9);
        assert_eq!(r.attempts_on("flux-pro"), 1);
    }

    #[test]
    fn test_diagnostic_summary_lists_attempts_and_verdict() {
        let r = report(RunOutcome::NeedsManualReview(ReviewReason::QualityNotMet));
        let summary = r.diagnostic_summary();

        assert!(summary.contains("NEEDS_MANUAL_REVIEW"));
        assert!(summary.contains("#1 flux-pro $0.000 transient failure (Timeout)"));
        assert!(summary.contains("#2 imagen $0.020 success"));
        assert!(summary.contains("validation score 0.45 FAIL"));
        assert!(summary.contains("Total cost: $0.021"));
        assert!(summary.contains("Manual review advised: yes"));
    }

    #[test]
    fn test_failed_run_does_not_advise_review() {
        let r = report(RunOutcome::Failed(FailedReason::ModelsExhausted));
        assert!(!r.manual_review_advised());
        assert!(r.diagnostic_summary().contains("Manual review advised: no"));
    }
}
