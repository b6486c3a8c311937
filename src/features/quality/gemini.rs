//! Gemini Vision scoring through Vertex AI `generateContent`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;

use super::{parse_score_response, QualityGate, ValidationOutcome, VALIDATION_COST};
use crate::core::{Config, GateFailurePolicy};
use crate::features::models::{Artifact, VertexAuth};

const VISION_MODEL: &str = "gemini-1.5-flash";

const VALIDATION_PROMPT: &str = r#"Analyze this hero image against the following prompt:

"{prompt}"

Score from 0.0 to 1.0 on these criteria:
1. Subject matter match (0-0.4): Does the image accurately represent the described subject?
2. Style/mood alignment (0-0.3): Does the style and mood match the prompt?
3. Professional quality (0-0.3): Is this suitable for professional marketing use?

Return your analysis as JSON:
{
  "score": 0.0-1.0,
  "breakdown": {
    "subject": 0.0-0.4,
    "style": 0.0-0.3,
    "quality": 0.0-0.3
  },
  "issues": ["list", "of", "issues"]
}
"#;

/// Why the vision model gave no reply, and what the attempt cost
struct Unanswered {
    reason: String,
    cost: f64,
}

impl Unanswered {
    fn billed(reason: String) -> Self {
        Self {
            reason,
            cost: VALIDATION_COST,
        }
    }
}

pub struct GeminiVisionGate {
    client: reqwest::Client,
    auth: Arc<VertexAuth>,
    min_score: f64,
    policy: GateFailurePolicy,
}

impl GeminiVisionGate {
    pub fn new(
        client: reqwest::Client,
        auth: Arc<VertexAuth>,
        min_score: f64,
        policy: GateFailurePolicy,
    ) -> Self {
        Self {
            client,
            auth,
            min_score,
            policy,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, crate::core::HeroError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                crate::core::HeroError::Configuration(format!("Failed to build HTTP client: {e}"))
            })?;
        Ok(Self::new(
            client,
            Arc::new(VertexAuth::from_config(config)),
            config.min_quality_score,
            config.gate_failure_policy,
        ))
    }

    /// One round trip to the vision model, returning its text reply
    async fn ask_vision_model(&self, image: &[u8], prompt: &str) -> Result<String, Unanswered> {
        // no request is sent without a token
        let token = self.auth.access_token().await.map_err(|f| Unanswered {
            reason: f.message,
            cost: 0.0,
        })?;
        let url = self.auth.endpoint(VISION_MODEL, "generateContent");
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": VALIDATION_PROMPT.replace("{prompt}", prompt) },
                    { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(image) } }
                ]
            }],
            "generationConfig": { "temperature": 0.0, "responseMimeType": "application/json" }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Unanswered::billed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(200).collect();
            return Err(Unanswered::billed(format!("HTTP {status}: {excerpt}")));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Unanswered::billed(format!("unreadable response: {e}")))?;

        let text: String = value
            .pointer("/candidates/0/content/parts")
            .and_then(|parts| parts.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(Unanswered::billed("response had no text candidates".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl QualityGate for GeminiVisionGate {
    fn min_score(&self) -> f64 {
        self.min_score
    }

    async fn validate(&self, artifact: &Artifact, prompt: &str) -> ValidationOutcome {
        info!("Validating {} with {}", artifact.id, VISION_MODEL);

        let image = match tokio::fs::read(&artifact.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot read {} for validation: {e}", artifact.path.display());
                return ValidationOutcome::gate_failure(
                    self.policy,
                    self.min_score,
                    &format!("image not readable: {e}"),
                    0.0,
                );
            }
        };

        let reply = match self.ask_vision_model(&image, prompt).await {
            Ok(reply) => reply,
            Err(unanswered) => {
                warn!(
                    "Quality gate unavailable, applying {:?}: {}",
                    self.policy, unanswered.reason
                );
                return ValidationOutcome::gate_failure(
                    self.policy,
                    self.min_score,
                    &unanswered.reason,
                    unanswered.cost,
                );
            }
        };

        match parse_score_response(&reply) {
            Some((score, feedback)) => {
                debug!("Vision score for {}: {score:.2}", artifact.id);
                ValidationOutcome::scored(score, self.min_score, feedback, VALIDATION_COST)
            }
            None => {
                warn!("Quality gate returned no usable score, applying {:?}", self.policy);
                ValidationOutcome::gate_failure(
                    self.policy,
                    self.min_score,
                    "malformed response",
                    VALIDATION_COST,
                )
            }
        }
    }
}
