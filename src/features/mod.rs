//! # Features
//!
//! One module per component of the hero image pipeline.

pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod quality;
pub mod session;

pub use ledger::{CostLedger, CostRecord, LedgerStatus};
pub use models::{Artifact, GenerationFailure, GenerationModel, ModelRegistry};
pub use orchestrator::{
    CancelHandle, GenerationOrchestrator, GenerationRequest, OrchestratorPolicy, RunOutcome,
    RunReport,
};
pub use quality::{GeminiVisionGate, QualityGate, ValidationOutcome};
pub use session::{CostSummary, ParamField, RefinementSession};
