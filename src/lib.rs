// Core layer - configuration and error taxonomy
pub mod core;

// Features layer - adapters, quality gate, ledger, orchestrator, session
pub mod features;

pub use core::{Config, HeroError, ImageSize};

pub use features::{
    // Ledger
    CostLedger, CostRecord, LedgerStatus,
    // Models
    Artifact, GenerationFailure, GenerationModel, ModelRegistry,
    // Orchestrator
    CancelHandle, GenerationOrchestrator, GenerationRequest, OrchestratorPolicy, RunOutcome,
    RunReport,
    // Quality
    GeminiVisionGate, QualityGate, ValidationOutcome,
    // Session
    CostSummary, ParamField, RefinementSession,
};
