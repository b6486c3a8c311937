//! Test double that replays a fixed script of provider outcomes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{write_artifact, Artifact, FailureReason, GenerationFailure, GenerationModel};
use crate::core::ImageSize;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Succeed,
    Fail(FailureReason),
    FailBilled(FailureReason),
}

pub(crate) struct ScriptedModel {
    name: String,
    cost: f64,
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    /// Once the script runs out every call succeeds
    pub(crate) fn new(name: &str, cost: f64, steps: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            cost,
            steps: Mutex::new(steps.iter().copied().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost_per_image(&self) -> f64 {
        self.cost
    }

    async fn generate(
        &self,
        prompt: &str,
        size: ImageSize,
        destination: &Path,
    ) -> Result<Artifact, GenerationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => {
                let bytes = format!("{}:{}", self.name, prompt);
                write_artifact(bytes.as_bytes(), destination, &self.name, size).await
            }
            Step::Fail(reason) => Err(GenerationFailure::new(reason, "scripted failure")),
            Step::FailBilled(reason) => {
                Err(GenerationFailure::new(reason, "scripted billed failure").billed())
            }
        }
    }
}
