//! # Feature: Generation Orchestrator
//!
//! Drives one generation request through an explicit state machine: attempt,
//! optional validation, retry after transient failures, and a single switch
//! to the fallback model. Every attempt is charged to the caller's
//! [`CostLedger`], and the run ends with a [`RunReport`] holding the full
//! history.
//!
//! - **Version**: 2.0.0
//! - **Since**: 0.3.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 2.0.0: Explicit state machine with global attempt budget and cancellation
//! - 1.1.0: Fallback model after repeated failures
//! - 1.0.0: Initial release with fixed retry loop

pub mod policy;
pub mod state;

use chrono::Local;
use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::features::ledger::{CostLedger, LedgerStatus};
use crate::features::models::{Artifact, FailureKind, GenerationModel};
use crate::features::quality::QualityGate;

pub use policy::{BackoffPolicy, CancelHandle, OrchestratorPolicy};
pub use state::{
    Attempt, AttemptOutcome, FailedReason, GenerationRequest, OrchestratorState, ReviewReason,
    RunOutcome, RunReport, ValidationRecord,
};

/// Validation failures tolerated on one model before switching
const MAX_VALIDATION_FAILURES: u32 = 2;

/// Prompts are cut to this many characters in log lines
const PROMPT_LOG_LIMIT: usize = 100;

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(limit).collect::<String>())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchCause {
    ProviderFailure,
    QualityNotMet,
}

/// Generated image waiting for its validation verdict
struct PendingArtifact {
    artifact: Artifact,
    attempt: u32,
    cost: f64,
}

/// Mutable bookkeeping for a single run
struct Run {
    run_id: String,
    model_index: usize,
    transient_failures: u32,
    validation_failures: u32,
    switch_cause: SwitchCause,
    pending: Option<PendingArtifact>,
    attempts: Vec<Attempt>,
    validations: Vec<ValidationRecord>,
    artifact: Option<Artifact>,
    trace: Vec<OrchestratorState>,
    outcome: Option<RunOutcome>,
}

impl Run {
    fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            model_index: 0,
            transient_failures: 0,
            validation_failures: 0,
            switch_cause: SwitchCause::ProviderFailure,
            pending: None,
            attempts: Vec::new(),
            validations: Vec::new(),
            artifact: None,
            trace: Vec::new(),
            outcome: None,
        }
    }

    fn finish(&mut self, outcome: RunOutcome) -> OrchestratorState {
        self.outcome = Some(outcome);
        match outcome {
            RunOutcome::Done => OrchestratorState::Done,
            RunOutcome::Failed(_) => OrchestratorState::Failed,
            RunOutcome::NeedsManualReview(_) => OrchestratorState::NeedsManualReview,
        }
    }
}

/// Runs requests against a primary model with an optional fallback
pub struct GenerationOrchestrator {
    models: Vec<Arc<dyn GenerationModel>>,
    gate: Option<Arc<dyn QualityGate>>,
    policy: OrchestratorPolicy,
    cancel: CancelHandle,
}

impl GenerationOrchestrator {
    /// A fallback with the same name as the primary is ignored
    pub fn new(
        primary: Arc<dyn GenerationModel>,
        fallback: Option<Arc<dyn GenerationModel>>,
        gate: Option<Arc<dyn QualityGate>>,
        policy: OrchestratorPolicy,
    ) -> Self {
        let mut models = vec![primary];
        if let Some(fallback) = fallback {
            if fallback.name() == models[0].name() {
                debug!("Fallback {} equals primary, running without fallback", fallback.name());
            } else {
                models.push(fallback);
            }
        }

        Self {
            models,
            gate,
            policy,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn primary(&self) -> &str {
        self.models[0].name()
    }

    pub fn fallback(&self) -> Option<&str> {
        self.models.get(1).map(|m| m.name())
    }

    /// Drive `request` to a terminal state, charging every attempt to `ledger`
    pub async fn run(&self, request: &GenerationRequest, ledger: &mut CostLedger) -> RunReport {
        let mut run = Run::new();
        let validating = request.validate && self.gate.is_some();

        info!(
            "Run {} started | Prompt: {} | Model: {} | Fallback: {} | Size: {} | Validation: {}",
            run.run_id,
            truncate(&request.prompt, PROMPT_LOG_LIMIT),
            self.primary(),
            self.fallback().unwrap_or("none"),
            request.size,
            validating
        );

        let mut state = OrchestratorState::Init;
        loop {
            debug!("Run {} -> {}", run.run_id, state);
            run.trace.push(state.clone());
            if state.is_terminal() {
                break;
            }

            if self.cancel.is_cancelled() {
                self.settle_pending(&mut run, request, ledger);
                warn!("Run {} cancelled in state {}", run.run_id, state);
                state = run.finish(RunOutcome::Failed(FailedReason::Cancelled));
                continue;
            }

            state = match state {
                OrchestratorState::Init => self.next_attempt(&mut run),
                OrchestratorState::Attempt(_) => {
                    self.attempt(&mut run, request, validating, ledger).await
                }
                OrchestratorState::Validate => self.validate(&mut run, request, ledger).await,
                OrchestratorState::RetryWait => {
                    let delay = self.policy.backoff.delay(run.transient_failures);
                    debug!("Run {} waiting {:?} before retry", run.run_id, delay);
                    tokio::time::sleep(delay).await;
                    self.next_attempt(&mut run)
                }
                OrchestratorState::SwitchModel => self.switch_model(&mut run),
                terminal => terminal,
            };
        }

        let report = RunReport {
            run_id: run.run_id,
            request: request.clone(),
            outcome: run
                .outcome
                .unwrap_or(RunOutcome::Failed(FailedReason::ModelsExhausted)),
            attempts: run.attempts,
            validations: run.validations,
            artifact: run.artifact,
            trace: run.trace,
        };

        if report.is_done() {
            info!(
                "Run {} finished: {} after {} attempt(s), cost ${:.3}",
                report.run_id,
                report.outcome,
                report.attempts.len(),
                report.total_cost()
            );
        } else {
            error!(
                "Run {} finished: {} after {} attempt(s), cost ${:.3}",
                report.run_id,
                report.outcome,
                report.attempts.len(),
                report.total_cost()
            );
        }
        report
    }

    fn current_model(&self, run: &Run) -> &Arc<dyn GenerationModel> {
        &self.models[run.model_index]
    }

    fn attempt_state(&self, run: &Run) -> OrchestratorState {
        OrchestratorState::Attempt(self.current_model(run).name().to_string())
    }

    fn budget_spent(&self, run: &Run) -> bool {
        run.attempts.len() as u32 >= self.policy.max_total_attempts
    }

    fn exhausted(&self, run: &mut Run) -> OrchestratorState {
        warn!(
            "Run {} used all {} attempts without an accepted image",
            run.run_id, self.policy.max_total_attempts
        );
        run.finish(RunOutcome::NeedsManualReview(ReviewReason::AttemptBudgetExhausted))
    }

    /// Attempt on the current model, or stop when the budget is spent
    fn next_attempt(&self, run: &mut Run) -> OrchestratorState {
        if self.budget_spent(run) {
            self.exhausted(run)
        } else {
            self.attempt_state(run)
        }
    }

    async fn attempt(
        &self,
        run: &mut Run,
        request: &GenerationRequest,
        validating: bool,
        ledger: &mut CostLedger,
    ) -> OrchestratorState {
        let model = Arc::clone(self.current_model(run));
        let number = run.attempts.len() as u32 + 1;
        let attempt_id = format!("{}-{}", run.run_id, number);
        let destination = self.policy.staging_directory.join(format!("{attempt_id}.png"));

        info!(
            "Run {} attempt {}/{} | Model: {}",
            run.run_id,
            number,
            self.policy.max_total_attempts,
            model.name()
        );

        match model.generate(&request.prompt, request.size, &destination).await {
            Ok(artifact) => {
                let cost = model.cost_per_image();
                run.attempts.push(Attempt {
                    number,
                    model: model.name().to_string(),
                    outcome: AttemptOutcome::Success,
                    cost,
                    timestamp: Local::now(),
                    message: None,
                });

                if validating {
                    run.pending = Some(PendingArtifact {
                        artifact,
                        attempt: number,
                        cost,
                    });
                    return OrchestratorState::Validate;
                }

                let status = LedgerStatus::Success;
                ledger.track(model.name(), cost, status, &artifact.id, request.size, 0.0);
                run.artifact = Some(artifact);
                run.finish(RunOutcome::Done)
            }
            Err(failure) => {
                let cost = if failure.billed { model.cost_per_image() } else { 0.0 };
                let (outcome, status) = match failure.kind() {
                    FailureKind::Transient => (
                        AttemptOutcome::TransientFailure(failure.reason),
                        LedgerStatus::TransientFailure,
                    ),
                    FailureKind::Permanent => (
                        AttemptOutcome::PermanentFailure(failure.reason),
                        LedgerStatus::PermanentFailure,
                    ),
                };

                match failure.kind() {
                    FailureKind::Transient => warn!(
                        "Run {} attempt {} on {} failed: {}",
                        run.run_id,
                        number,
                        model.name(),
                        failure
                    ),
                    FailureKind::Permanent => error!(
                        "Run {} attempt {} on {} failed permanently: {}",
                        run.run_id,
                        number,
                        model.name(),
                        failure
                    ),
                }
                ledger.track(model.name(), cost, status, &attempt_id, request.size, 0.0);
                run.attempts.push(Attempt {
                    number,
                    model: model.name().to_string(),
                    outcome,
                    cost,
                    timestamp: Local::now(),
                    message: Some(failure.message),
                });

                run.switch_cause = SwitchCause::ProviderFailure;
                match failure.reason.kind() {
                    FailureKind::Transient => {
                        run.transient_failures += 1;
                        if run.transient_failures >= self.policy.max_retries {
                            OrchestratorState::SwitchModel
                        } else if self.budget_spent(run) {
                            self.exhausted(run)
                        } else {
                            OrchestratorState::RetryWait
                        }
                    }
                    FailureKind::Permanent => OrchestratorState::SwitchModel,
                }
            }
        }
    }

    async fn validate(
        &self,
        run: &mut Run,
        request: &GenerationRequest,
        ledger: &mut CostLedger,
    ) -> OrchestratorState {
        let Some(pending) = run.pending.take() else {
            return self.attempt_state(run);
        };
        let Some(gate) = &self.gate else {
            run.pending = Some(pending);
            self.settle_pending(run, request, ledger);
            return run.finish(RunOutcome::Done);
        };

        let verdict = gate.validate(&pending.artifact, &request.prompt).await;
        let model = pending.artifact.model.clone();
        let status = if verdict.passed {
            LedgerStatus::Success
        } else {
            LedgerStatus::ValidationFailed
        };
        ledger.track(
            &model,
            pending.cost,
            status,
            &pending.artifact.id,
            request.size,
            verdict.cost,
        );
        run.validations.push(ValidationRecord {
            attempt: pending.attempt,
            model: model.clone(),
            outcome: verdict.clone(),
        });

        if verdict.passed {
            info!(
                "Run {} image from {} passed validation with {:.2}",
                run.run_id, model, verdict.score
            );
            run.artifact = Some(pending.artifact);
            return run.finish(RunOutcome::Done);
        }

        warn!(
            "Run {} image from {} scored {:.2}, below {:.2}: {}",
            run.run_id,
            model,
            verdict.score,
            gate.min_score(),
            verdict.feedback
        );
        run.artifact = Some(self.shelve_failed(pending.artifact).await);
        run.validation_failures += 1;

        if run.validation_failures < MAX_VALIDATION_FAILURES {
            self.next_attempt(run)
        } else {
            run.switch_cause = SwitchCause::QualityNotMet;
            OrchestratorState::SwitchModel
        }
    }

    fn switch_model(&self, run: &mut Run) -> OrchestratorState {
        if run.model_index + 1 < self.models.len() {
            let from = self.current_model(run).name().to_string();
            run.model_index += 1;
            run.transient_failures = 0;
            run.validation_failures = 0;
            info!(
                "Run {} switching from {} to {}",
                run.run_id,
                from,
                self.current_model(run).name()
            );
            return self.next_attempt(run);
        }

        match run.switch_cause {
            SwitchCause::QualityNotMet => {
                run.finish(RunOutcome::NeedsManualReview(ReviewReason::QualityNotMet))
            }
            SwitchCause::ProviderFailure => {
                run.finish(RunOutcome::Failed(FailedReason::ModelsExhausted))
            }
        }
    }

    /// Charge an image that will never be validated and keep it as the result
    fn settle_pending(
        &self,
        run: &mut Run,
        request: &GenerationRequest,
        ledger: &mut CostLedger,
    ) {
        if let Some(pending) = run.pending.take() {
            ledger.track(
                &pending.artifact.model,
                pending.cost,
                LedgerStatus::Success,
                &pending.artifact.id,
                request.size,
                0.0,
            );
            run.artifact = Some(pending.artifact);
        }
    }

    /// Move a rejected image to the failed-output directory when enabled
    async fn shelve_failed(&self, artifact: Artifact) -> Artifact {
        if !self.policy.save_failed_generations {
            return artifact;
        }
        let Some(file_name) = artifact.path.file_name() else {
            return artifact;
        };

        let directory = &self.policy.failed_output_directory;
        let target = directory.join(file_name);
        let moved = async {
            tokio::fs::create_dir_all(directory).await?;
            if tokio::fs::rename(&artifact.path, &target).await.is_err() {
                tokio::fs::copy(&artifact.path, &target).await?;
                tokio::fs::remove_file(&artifact.path).await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        match moved {
            Ok(()) => {
                debug!("Saved failed generation to {}", target.display());
                Artifact {
                    path: target,
                    ..artifact
                }
            }
            Err(e) => {
                error!(
                    "Could not move {} to {}: {e}",
                    artifact.path.display(),
                    directory.display()
                );
                artifact
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ImageSize;
    use crate::features::models::scripted::{ScriptedModel, Step};
    use crate::features::models::{FailureReason, GenerationFailure};
    use crate::features::quality::scripted::ScriptedGate;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    /// Interrupts the run right after the wrapped model returns
    struct CancellingModel {
        inner: Arc<ScriptedModel>,
        cancel: CancelHandle,
    }

    #[async_trait]
    impl GenerationModel for CancellingModel {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn cost_per_image(&self) -> f64 {
            self.inner.cost_per_image()
        }

        async fn generate(
            &self,
            prompt: &str,
            size: ImageSize,
            destination: &Path,
        ) -> Result<Artifact, GenerationFailure> {
            let result = self.inner.generate(prompt, size, destination).await;
            self.cancel.cancel();
            result
        }
    }

    fn policy(root: &Path) -> OrchestratorPolicy {
        OrchestratorPolicy {
            max_retries: 2,
            max_total_attempts: 6,
            backoff: BackoffPolicy::Fixed(Duration::ZERO),
            staging_directory: root.join("staging"),
            save_failed_generations: true,
            failed_output_directory: root.join("failed"),
        }
    }

    fn request(validate: bool) -> GenerationRequest {
        GenerationRequest {
            prompt: "a lighthouse at dusk".to_string(),
            size: ImageSize::new(1200, 630),
            model: "flux-pro".to_string(),
            validate,
        }
    }

    fn models_of(report: &RunReport) -> Vec<&str> {
        report.attempts.iter().map(|a| a.model.as_str()).collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_transient_failures_switch_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let primary = ScriptedModel::new(
            "flux-pro",
            0.055,
            &[Step::Fail(FailureReason::Timeout), Step::Fail(FailureReason::Timeout)],
        );
        let fallback = ScriptedModel::new("imagen", 0.020, &[]);
        let orchestrator = GenerationOrchestrator::new(
            primary.clone(),
            Some(fallback.clone()),
            None,
            policy(dir.path()),
        );
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(false), &mut ledger).await;

        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(models_of(&report), vec!["flux-pro", "flux-pro", "imagen"]);
        assert_eq!(
            report.attempts[0].outcome,
            AttemptOutcome::TransientFailure(FailureReason::Timeout)
        );
        assert_eq!(report.attempts[2].outcome, AttemptOutcome::Success);
        assert_eq!(primary.calls(), 2);
        assert_eq!(fallback.calls(), 1);
        assert!(report.trace.contains(&OrchestratorState::RetryWait));
        assert!(report.trace.contains(&OrchestratorState::SwitchModel));
        assert!(report.artifact.as_ref().unwrap().path.exists());
        assert_eq!(ledger.records().len(), 3);
        assert!(approx(ledger.session_total(), 0.020));
    }

    #[tokio::test]
    async fn test_repeated_validation_failure_switches_model() {
        let dir = tempfile::tempdir().unwrap();
        let primary = ScriptedModel::new("flux-pro", 0.055, &[]);
        let fallback = ScriptedModel::new("imagen", 0.020, &[]);
        let gate = ScriptedGate::new(0.6, &[0.45, 0.5, 0.8]);
        let orchestrator = GenerationOrchestrator::new(
            primary.clone(),
            Some(fallback.clone()),
            Some(gate.clone()),
            policy(dir.path()),
        );
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(true), &mut ledger).await;

        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.attempts_on("flux-pro"), 2);
        assert_eq!(report.attempts_on("imagen"), 1);
        assert_eq!(gate.seen_models(), vec!["flux-pro", "flux-pro", "imagen"]);
        assert_eq!(report.validations.len(), 3);
        assert_eq!(report.artifact.as_ref().unwrap().model, "imagen");

        let failed: Vec<_> = std::fs::read_dir(dir.path().join("failed")).unwrap().collect();
        assert_eq!(failed.len(), 2);
        assert_eq!(
            ledger
                .records()
                .iter()
                .filter(|r| r.status == LedgerStatus::ValidationFailed)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let dir = tempfile::tempdir().unwrap();
        let primary =
            ScriptedModel::new("flux-pro", 0.055, &[Step::Fail(FailureReason::Unauthorized)]);
        let fallback = ScriptedModel::new("imagen", 0.020, &[]);
        let orchestrator =
            GenerationOrchestrator::new(primary.clone(), Some(fallback), None, policy(dir.path()));
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(false), &mut ledger).await;

        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(primary.calls(), 1);
        assert_eq!(models_of(&report), vec!["flux-pro", "imagen"]);
        assert!(!report.trace.contains(&OrchestratorState::RetryWait));
    }

    #[tokio::test]
    async fn test_fallback_failure_ends_failed_with_history() {
        let dir = tempfile::tempdir().unwrap();
        let primary =
            ScriptedModel::new("flux-pro", 0.055, &[Step::Fail(FailureReason::InvalidInput)]);
        let fallback = ScriptedModel::new(
            "imagen",
            0.020,
            &[Step::Fail(FailureReason::ServerError), Step::Fail(FailureReason::RateLimited)],
        );
        let orchestrator =
            GenerationOrchestrator::new(primary, Some(fallback), None, policy(dir.path()));
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(false), &mut ledger).await;

        assert_eq!(report.outcome, RunOutcome::Failed(FailedReason::ModelsExhausted));
        assert_eq!(report.trace.last(), Some(&OrchestratorState::Failed));
        assert_eq!(models_of(&report), vec!["flux-pro", "imagen", "imagen"]);
        assert!(report.artifact.is_none());
        assert!(!report.manual_review_advised());
        assert_eq!(ledger.records().len(), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_never_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = policy(dir.path());
        policy.max_retries = 10;
        policy.max_total_attempts = 3;
        let primary =
            ScriptedModel::new("flux-pro", 0.055, &[Step::Fail(FailureReason::Network); 10]);
        let fallback = ScriptedModel::new("imagen", 0.020, &[]);
        let orchestrator =
            GenerationOrchestrator::new(primary.clone(), Some(fallback.clone()), None, policy);
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(false), &mut ledger).await;

        assert_eq!(
            report.outcome,
            RunOutcome::NeedsManualReview(ReviewReason::AttemptBudgetExhausted)
        );
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 0);
        assert_eq!(report.attempts.len(), 3);
        let attempt_states = report
            .trace
            .iter()
            .filter(|s| matches!(s, OrchestratorState::Attempt(_)))
            .count();
        assert_eq!(attempt_states, 3);
        assert_eq!(
            report.trace.iter().filter(|s| **s == OrchestratorState::RetryWait).count(),
            2
        );
        assert!(report.manual_review_advised());
    }

    #[tokio::test]
    async fn test_spent_budget_skips_retry_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = policy(dir.path());
        policy.max_retries = 5;
        policy.max_total_attempts = 1;
        policy.backoff = BackoffPolicy::Fixed(Duration::from_secs(3600));
        let primary = ScriptedModel::new("flux-pro", 0.055, &[Step::Fail(FailureReason::Timeout)]);
        let orchestrator = GenerationOrchestrator::new(primary.clone(), None, None, policy);
        let mut ledger = CostLedger::in_memory();

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.run(&request(false), &mut ledger),
        )
        .await
        .expect("run should stop without waiting for the backoff");

        assert_eq!(
            report.outcome,
            RunOutcome::NeedsManualReview(ReviewReason::AttemptBudgetExhausted)
        );
        assert_eq!(primary.calls(), 1);
        assert_eq!(
            report.trace,
            vec![
                OrchestratorState::Init,
                OrchestratorState::Attempt("flux-pro".to_string()),
                OrchestratorState::NeedsManualReview,
            ]
        );
    }

    #[tokio::test]
    async fn test_ledger_matches_attempt_and_validation_costs() {
        let dir = tempfile::tempdir().unwrap();
        let primary = ScriptedModel::new(
            "flux-pro",
            0.055,
            &[
                Step::FailBilled(FailureReason::Resource),
                Step::Fail(FailureReason::Timeout),
            ],
        );
        let fallback = ScriptedModel::new("imagen", 0.020, &[]);
        let gate = ScriptedGate::new(0.6, &[0.3, 0.9]);
        let orchestrator =
            GenerationOrchestrator::new(primary, Some(fallback), Some(gate), policy(dir.path()));
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(true), &mut ledger).await;

        assert_eq!(report.outcome, RunOutcome::Done);
        // billed failure, free timeout, then imagen twice with two validations
        assert!(approx(report.total_cost(), 0.055 + 0.020 * 2.0 + 0.001 * 2.0));
        assert!(approx(ledger.session_total(), report.total_cost()));
        assert_eq!(ledger.records().len(), report.attempts.len());
    }

    #[tokio::test]
    async fn test_quality_not_met_without_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let primary = ScriptedModel::new("flux-pro", 0.055, &[]);
        let gate = ScriptedGate::new(0.6, &[0.2, 0.59]);
        let orchestrator =
            GenerationOrchestrator::new(primary.clone(), None, Some(gate), policy(dir.path()));
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(true), &mut ledger).await;

        assert_eq!(report.outcome, RunOutcome::NeedsManualReview(ReviewReason::QualityNotMet));
        assert_eq!(primary.calls(), 2);
        let last = report.artifact.as_ref().unwrap();
        assert!(last.path.starts_with(dir.path().join("failed")));
        assert!(last.path.exists());
    }

    #[tokio::test]
    async fn test_fallback_equal_to_primary_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let primary =
            ScriptedModel::new("flux-pro", 0.055, &[Step::Fail(FailureReason::ContentRejected)]);
        let same = ScriptedModel::new("flux-pro", 0.055, &[]);
        let orchestrator =
            GenerationOrchestrator::new(primary, Some(same.clone()), None, policy(dir.path()));
        assert_eq!(orchestrator.fallback(), None);

        let report = orchestrator.run(&request(false), &mut CostLedger::in_memory()).await;

        assert_eq!(report.outcome, RunOutcome::Failed(FailedReason::ModelsExhausted));
        assert_eq!(same.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_issues_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let primary = ScriptedModel::new("flux-pro", 0.055, &[]);
        let cancel = CancelHandle::new();
        let orchestrator =
            GenerationOrchestrator::new(primary.clone(), None, None, policy(dir.path()))
                .with_cancel(cancel.clone());
        cancel.cancel();

        let report = orchestrator.run(&request(false), &mut CostLedger::in_memory()).await;

        assert_eq!(report.outcome, RunOutcome::Failed(FailedReason::Cancelled));
        assert_eq!(primary.calls(), 0);
        assert_eq!(report.trace, vec![OrchestratorState::Init, OrchestratorState::Failed]);
    }

    #[tokio::test]
    async fn test_cancel_before_validation_charges_and_keeps_image() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelHandle::new();
        let primary = Arc::new(CancellingModel {
            inner: ScriptedModel::new("flux-pro", 0.055, &[]),
            cancel: cancel.clone(),
        });
        let gate = ScriptedGate::new(0.6, &[0.9]);
        let orchestrator =
            GenerationOrchestrator::new(primary, None, Some(gate.clone()), policy(dir.path()))
                .with_cancel(cancel);
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(true), &mut ledger).await;

        assert_eq!(report.outcome, RunOutcome::Failed(FailedReason::Cancelled));
        assert!(report.artifact.is_some());
        assert!(report.artifact.as_ref().unwrap().path.exists());
        assert_eq!(gate.calls(), 0);
        assert!(report.validations.is_empty());
        assert!(approx(report.total_cost(), 0.055));
        assert!(approx(ledger.session_total(), report.total_cost()));
        assert_eq!(ledger.records().len(), 1);
    }

    #[test]
    fn test_prompt_truncated_for_logs() {
        assert_eq!(truncate("short", PROMPT_LOG_LIMIT), "short");
        let long = "x".repeat(150);
        assert_eq!(truncate(&long, PROMPT_LOG_LIMIT).len(), 103);
    }

    #[tokio::test]
    async fn test_validation_disabled_skips_gate() {
        let dir = tempfile::tempdir().unwrap();
        let primary = ScriptedModel::new("flux-dev", 0.020, &[]);
        let gate = ScriptedGate::new(0.6, &[0.1]);
        let orchestrator =
            GenerationOrchestrator::new(primary, None, Some(gate.clone()), policy(dir.path()));
        let mut ledger = CostLedger::in_memory();

        let report = orchestrator.run(&request(false), &mut ledger).await;

        assert!(report.is_done());
        assert_eq!(gate.calls(), 0);
        assert!(!report.trace.contains(&OrchestratorState::Validate));
        assert_eq!(ledger.records()[0].status, LedgerStatus::Success);
    }
}
