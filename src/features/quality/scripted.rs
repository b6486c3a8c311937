//! Test double that replays fixed validation scores.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{QualityGate, ValidationOutcome, VALIDATION_COST};
use crate::features::models::Artifact;

pub(crate) struct ScriptedGate {
    threshold: f64,
    scores: Mutex<VecDeque<f64>>,
    seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedGate {
    /// Once the scores run out every call scores 1.0
    pub(crate) fn new(threshold: f64, scores: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            threshold,
            scores: Mutex::new(scores.iter().copied().collect()),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Models whose artifacts were validated, in order
    pub(crate) fn seen_models(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl QualityGate for ScriptedGate {
    fn min_score(&self) -> f64 {
        self.threshold
    }

    async fn validate(&self, artifact: &Artifact, _prompt: &str) -> ValidationOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(artifact.model.clone());
        let score = self.scores.lock().unwrap().pop_front().unwrap_or(1.0);
        ValidationOutcome::scored(score, self.threshold, "scripted", VALIDATION_COST)
    }
}
