//! # Feature: Refinement Session
//!
//! Interactive loop around the orchestrator: regenerate, tweak one parameter,
//! regenerate again, and finally accept or abandon. All runs in a session share
//! one [`CostLedger`], and every run report is kept for audit.
//!
//! - **Version**: 1.1.0
//! - **Since**: 0.4.0
//! - **Toggleable**: true
//!
//! ## Changelog
//! - 1.1.0: Per-session ledger, abandon, cost estimate
//! - 1.0.0: Initial release with regenerate/modify/accept

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::core::{Config, HeroError};
use crate::features::ledger::CostLedger;
use crate::features::models::{Artifact, ModelRegistry};
use crate::features::orchestrator::{
    CancelHandle, GenerationOrchestrator, GenerationRequest, OrchestratorPolicy, RunOutcome,
    RunReport,
};
use crate::features::quality::{GeminiVisionGate, QualityGate, VALIDATION_COST};

/// File name used by `accept` when none is given
pub const DEFAULT_FILENAME: &str = "hero_image.png";

/// Parameter that `modify` can change between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamField {
    Prompt,
    Model,
    Size,
    Validation,
}

impl FromStr for ParamField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prompt" => Ok(ParamField::Prompt),
            "model" => Ok(ParamField::Model),
            "size" => Ok(ParamField::Size),
            "validation" | "validate" => Ok(ParamField::Validation),
            _ => Err(format!(
                "Unknown field '{s}'. Expected prompt, model, size or validation"
            )),
        }
    }
}

/// Cost totals returned when a session ends
#[derive(Debug, Clone, PartialEq)]
pub struct CostSummary {
    pub total: f64,
    pub breakdown: BTreeMap<String, f64>,
    /// Where the accepted image was written; None when abandoned
    pub final_path: Option<PathBuf>,
}

impl fmt::Display for CostSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (model, cost) in &self.breakdown {
            writeln!(f, "{model}: ${cost:.3}")?;
        }
        write!(f, "Total: ${:.3}", self.total)?;
        if let Some(path) = &self.final_path {
            write!(f, "\nSaved to: {}", path.display())?;
        }
        Ok(())
    }
}

pub struct RefinementSession {
    config: Config,
    registry: ModelRegistry,
    gate: Option<Arc<dyn QualityGate>>,
    request: GenerationRequest,
    ledger: CostLedger,
    history: Vec<RunReport>,
    cancel: CancelHandle,
    finished: bool,
}

impl RefinementSession {
    pub fn new(
        config: Config,
        registry: ModelRegistry,
        gate: Option<Arc<dyn QualityGate>>,
        request: GenerationRequest,
    ) -> Result<Self, HeroError> {
        if !registry.contains(&request.model) {
            return Err(HeroError::UnknownModel(request.model));
        }
        if !registry.contains(&config.fallback_model) {
            return Err(HeroError::UnknownModel(config.fallback_model));
        }
        if request.validate && gate.is_none() {
            return Err(HeroError::Configuration(
                "validation requested but no quality gate is configured".to_string(),
            ));
        }
        let ledger = CostLedger::new(config.cost_log_path());

        Ok(Self {
            config,
            registry,
            gate,
            request,
            ledger,
            history: Vec::new(),
            cancel: CancelHandle::new(),
            finished: false,
        })
    }

    /// Session with live adapters, the default model and the medium preset
    pub fn from_config(config: Config, prompt: &str) -> Result<Self, HeroError> {
        let registry = ModelRegistry::from_config(&config)?;
        let gate: Option<Arc<dyn QualityGate>> = if config.enable_quality_check {
            Some(Arc::new(GeminiVisionGate::from_config(&config)?))
        } else {
            None
        };
        let request = GenerationRequest {
            prompt: prompt.to_string(),
            size: config.size_medium,
            model: config.default_model.clone(),
            validate: config.enable_quality_check,
        };
        Self::new(config, registry, gate, request)
    }

    /// Parameters the next `regenerate` will use
    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn history(&self) -> &[RunReport] {
        &self.history
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn total_cost(&self) -> f64 {
        self.ledger.session_total()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Expected cost of one successful attempt with the current parameters
    pub fn cost_estimate(&self) -> f64 {
        let generation = self
            .registry
            .get(&self.request.model)
            .map(|m| m.cost_per_image())
            .unwrap_or(0.0);
        if self.request.validate && self.gate.is_some() {
            generation + VALIDATION_COST
        } else {
            generation
        }
    }

    /// Image from the most recent run that reached DONE
    pub fn latest_artifact(&self) -> Option<&Artifact> {
        self.history
            .iter()
            .rev()
            .find(|r| r.is_done())
            .and_then(|r| r.artifact.as_ref())
    }

    /// Change one parameter before the next run
    pub fn modify(&mut self, field: ParamField, value: &str) -> Result<(), HeroError> {
        self.ensure_open()?;
        let value = value.trim();

        match field {
            ParamField::Prompt => {
                if value.is_empty() {
                    return Err(HeroError::Configuration("prompt cannot be empty".to_string()));
                }
                self.request.prompt = value.to_string();
            }
            ParamField::Model => {
                if !self.registry.contains(value) {
                    return Err(HeroError::UnknownModel(value.to_string()));
                }
                self.request.model = value.to_string();
            }
            ParamField::Size => {
                self.request.size = self.config.resolve_size(value).ok_or_else(|| {
                    HeroError::Configuration(format!(
                        "Invalid size '{value}'. Use small, medium, large or WxH"
                    ))
                })?;
            }
            ParamField::Validation => {
                let validate = match value.to_lowercase().as_str() {
                    "on" | "true" | "yes" | "1" => true,
                    "off" | "false" | "no" | "0" => false,
                    _ => {
                        return Err(HeroError::Configuration(format!(
                            "Invalid validation toggle '{value}'. Use on or off"
                        )))
                    }
                };
                if validate && self.gate.is_none() {
                    return Err(HeroError::Configuration(
                        "Quality check is disabled (ENABLE_QUALITY_CHECK=false)".to_string(),
                    ));
                }
                self.request.validate = validate;
            }
        }

        info!("Session parameter {:?} set to '{}'", field, value);
        Ok(())
    }

    /// Run the orchestrator once with the current parameters
    pub async fn regenerate(&mut self) -> Result<RunReport, HeroError> {
        self.ensure_open()?;
        self.cancel.reset();

        let primary = self.registry.get(&self.request.model)?;
        let fallback = self.registry.get(&self.config.fallback_model)?;

        let orchestrator = GenerationOrchestrator::new(
            primary,
            Some(fallback),
            self.gate.clone(),
            OrchestratorPolicy::from_config(&self.config),
        )
        .with_cancel(self.cancel.clone());

        let report = orchestrator.run(&self.request, &mut self.ledger).await;
        self.history.push(report.clone());

        match report.outcome {
            RunOutcome::Done => Ok(report),
            RunOutcome::Failed(_) => Err(HeroError::GenerationFailed(Box::new(report))),
            RunOutcome::NeedsManualReview(_) => Err(HeroError::NeedsManualReview(Box::new(report))),
        }
    }

    /// Copy the latest successful image to the output directory and close the session
    pub async fn accept(&mut self, filename: Option<&str>) -> Result<CostSummary, HeroError> {
        self.ensure_open()?;
        let artifact = self.latest_artifact().cloned().ok_or(HeroError::NothingToAccept)?;

        let mut name = filename
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_FILENAME)
            .to_string();
        if !name.to_lowercase().ends_with(".png") {
            name.push_str(".png");
        }

        tokio::fs::create_dir_all(&self.config.output_directory).await?;
        let final_path = self.config.output_directory.join(name);
        tokio::fs::copy(&artifact.path, &final_path).await?;

        info!(
            "Accepted image from {} -> {} (session total ${:.3})",
            artifact.model,
            final_path.display(),
            self.total_cost()
        );
        Ok(self.finish(Some(final_path)))
    }

    /// Close the session without keeping an image
    pub fn abandon(&mut self) -> Result<CostSummary, HeroError> {
        self.ensure_open()?;
        info!("Session abandoned after {} run(s)", self.history.len());
        Ok(self.finish(None))
    }

    fn finish(&mut self, final_path: Option<PathBuf>) -> CostSummary {
        self.finished = true;
        self.ledger.flush();
        self.clear_staging();
        CostSummary {
            total: self.ledger.session_total(),
            breakdown: self.ledger.breakdown(),
            final_path,
        }
    }

    /// Remove this session's staged images. Copies in the output and
    /// failed-output directories are kept.
    fn clear_staging(&self) {
        let entries = match std::fs::read_dir(&self.config.staging_directory) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Staging directory not readable: {e}");
                return;
            }
        };
        let prefixes: Vec<String> = self.history.iter().map(|r| format!("{}-", r.run_id)).collect();

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => debug!("Removed staged image {name}"),
                Err(e) => warn!("Could not remove staged image {name}: {e}"),
            }
        }
    }

    fn ensure_open(&self) -> Result<(), HeroError> {
        if self.finished {
            Err(HeroError::SessionFinished)
        } else {
            Ok(())
        }
    }
}

impl Drop for RefinementSession {
    fn drop(&mut self) {
        if !self.finished {
            self.ledger.flush();
        }
    }
}
