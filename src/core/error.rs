//! # Error Taxonomy
//!
//! Errors that reach the caller. Transient provider failures and failed quality
//! checks are recovered inside the orchestrator and only surface here, with the
//! full attempt history, once every budget is spent.

use thiserror::Error;

use crate::features::orchestrator::RunReport;

#[derive(Debug, Error)]
pub enum HeroError {
    /// Missing credentials or invalid settings; raised before any attempt
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A model name that is not in the registry
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// Local I/O failure while saving or reading an artifact
    #[error("resource error: {0}")]
    Resource(String),

    /// Every available model failed
    #[error("generation failed: {}", .0.outcome)]
    GenerationFailed(Box<RunReport>),

    /// Budgets ran out before an acceptable image was produced
    #[error("manual review needed: {}", .0.outcome)]
    NeedsManualReview(Box<RunReport>),

    /// `accept` called without a successful artifact in the session
    #[error("no successful image to accept in this session")]
    NothingToAccept,

    /// The session was already accepted or abandoned
    #[error("session is already finished")]
    SessionFinished,
}

impl HeroError {
    /// The attempt history attached to exhausted runs
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            HeroError::GenerationFailed(report) | HeroError::NeedsManualReview(report) => {
                Some(report)
            }
            _ => None,
        }
    }

    /// Whether a human should look at the result before retrying
    pub fn manual_review_advised(&self) -> bool {
        matches!(self, HeroError::NeedsManualReview(_))
    }
}

impl From<std::io::Error> for HeroError {
    fn from(e: std::io::Error) -> Self {
        HeroError::Resource(e.to_string())
    }
}
