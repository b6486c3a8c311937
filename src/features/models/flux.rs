//! # Flux via Replicate
//!
//! Runs Black Forest Labs Flux models through the Replicate predictions API.
//! Three variants share this adapter and differ only in their registry entry:
//! pro ($0.055), dev ($0.020) and schnell ($0.010).

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

use super::{
    write_artifact, Artifact, FailureReason, GenerationFailure, GenerationModel, ModelDescriptor,
};
use crate::core::ImageSize;

const REPLICATE_API: &str = "https://api.replicate.com/v1";

/// Delay between prediction status polls
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Give up polling after this many checks
const MAX_POLLS: u32 = 180;

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: Option<String>,
}

/// Where a prediction stands after one response
#[derive(Debug, PartialEq)]
enum PredictionState {
    Pending,
    Ready(String),
    Failed(GenerationFailure),
}

pub struct FluxModel {
    descriptor: &'static ModelDescriptor,
    client: reqwest::Client,
    api_token: String,
}

impl FluxModel {
    pub fn new(
        descriptor: &'static ModelDescriptor,
        client: reqwest::Client,
        api_token: String,
    ) -> Self {
        Self {
            descriptor,
            client,
            api_token,
        }
    }

    pub fn display_name(&self) -> &'static str {
        self.descriptor.display_name
    }

    async fn create_prediction(
        &self,
        prompt: &str,
        size: ImageSize,
    ) -> Result<Prediction, GenerationFailure> {
        let url = format!(
            "{REPLICATE_API}/models/{}/predictions",
            self.descriptor.provider_model_id
        );
        let body = json!({
            "input": {
                "prompt": prompt,
                "width": size.width,
                "height": size.height,
                "output_format": "png",
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationFailure::from_reqwest(&e))?;

        Self::parse_prediction(response).await
    }

    async fn poll_prediction(&self, get_url: &str) -> Result<Prediction, GenerationFailure> {
        let response = self
            .client
            .get(get_url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            // Once created the prediction runs and is charged regardless of our polling
            .map_err(|e| GenerationFailure::from_reqwest(&e).billed())?;

        Self::parse_prediction(response)
            .await
            .map_err(GenerationFailure::billed)
    }

    async fn parse_prediction(
        response: reqwest::Response,
    ) -> Result<Prediction, GenerationFailure> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationFailure::from_status(status, &body));
        }

        response.json::<Prediction>().await.map_err(|e| {
            GenerationFailure::new(
                FailureReason::MalformedResponse,
                format!("unexpected Replicate response: {e}"),
            )
        })
    }

    async fn download(&self, image_url: &str) -> Result<Vec<u8>, GenerationFailure> {
        let response = self
            .client
            .get(image_url)
            .send()
            .await
            .map_err(|e| GenerationFailure::from_reqwest(&e).billed())?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut failure = GenerationFailure::from_status(status, &body).billed();
            // The image exists; a failed fetch is worth another try
            failure.reason = FailureReason::Network;
            return Err(failure);
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| GenerationFailure::from_reqwest(&e).billed())
    }
}

/// Interpret a prediction snapshot
fn prediction_state(prediction: &Prediction) -> PredictionState {
    match prediction.status.as_str() {
        "succeeded" => match prediction.output.as_ref().and_then(output_url) {
            Some(url) => PredictionState::Ready(url),
            None => PredictionState::Failed(
                GenerationFailure::new(
                    FailureReason::MalformedResponse,
                    format!("prediction {} succeeded without an output URL", prediction.id),
                )
                .billed(),
            ),
        },
        "failed" => {
            let message = prediction
                .error
                .as_ref()
                .map(|e| e.as_str().map(String::from).unwrap_or_else(|| e.to_string()))
                .unwrap_or_else(|| "prediction failed".to_string());
            let lower = message.to_lowercase();
            let rejected = ["nsfw", "safety", "flagged"].iter().any(|w| lower.contains(w));
            let reason = if rejected {
                FailureReason::ContentRejected
            } else if lower.contains("invalid") || lower.contains("must be") {
                FailureReason::InvalidInput
            } else {
                FailureReason::ServerError
            };
            PredictionState::Failed(GenerationFailure::new(reason, message))
        }
        "canceled" => PredictionState::Failed(GenerationFailure::new(
            FailureReason::ServerError,
            format!("prediction {} was canceled", prediction.id),
        )),
        _ => PredictionState::Pending,
    }
}

/// Replicate returns either a single URL or a list of URLs
fn output_url(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(url) => Some(url.clone()),
        serde_json::Value::Array(items) => items.iter().find_map(|v| v.as_str().map(String::from)),
        _ => None,
    }
}

#[async_trait]
impl GenerationModel for FluxModel {
    fn name(&self) -> &str {
        self.descriptor.name
    }

    fn cost_per_image(&self) -> f64 {
        self.descriptor.cost_per_image
    }

    async fn generate(
        &self,
        prompt: &str,
        size: ImageSize,
        destination: &Path,
    ) -> Result<Artifact, GenerationFailure> {
        info!(
            "Replicate prediction | Model: {} | Size: {}",
            self.descriptor.provider_model_id, size
        );

        let mut prediction = self.create_prediction(prompt, size).await?;
        let mut polls = 0;

        let image_url = loop {
            match prediction_state(&prediction) {
                PredictionState::Ready(url) => break url,
                PredictionState::Failed(failure) => {
                    warn!("Replicate prediction {} failed: {}", prediction.id, failure.message);
                    return Err(failure);
                }
                PredictionState::Pending => {
                    polls += 1;
                    if polls > MAX_POLLS {
                        return Err(GenerationFailure::new(
                            FailureReason::Timeout,
                            format!(
                                "prediction {} still {} after polling",
                                prediction.id, prediction.status
                            ),
                        )
                        .billed());
                    }
                    let get_url = prediction
                        .urls
                        .as_ref()
                        .and_then(|u| u.get.clone())
                        .ok_or_else(|| {
                            GenerationFailure::new(
                                FailureReason::MalformedResponse,
                                "pending prediction without a status URL",
                            )
                            .billed()
                        })?;
                    debug!("Prediction {} is {}, polling", prediction.id, prediction.status);
                    sleep(POLL_INTERVAL).await;
                    prediction = self.poll_prediction(&get_url).await?;
                }
            }
        };

        let bytes = self.download(&image_url).await?;
        write_artifact(&bytes, destination, self.name(), size).await
    }
}
