//! Shared Google Vertex AI endpoint and access-token handling.
//!
//! Tokens come from `GCP_ACCESS_TOKEN` when set, otherwise from
//! `gcloud auth print-access-token`, cached for most of their lifetime.

use log::{debug, info};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{FailureReason, GenerationFailure};
use crate::core::Config;

/// gcloud tokens live for an hour
const TOKEN_REFRESH_AFTER: Duration = Duration::from_secs(50 * 60);

pub struct VertexAuth {
    project_id: String,
    location: String,
    static_token: Option<String>,
    cached: Mutex<Option<(String, Instant)>>,
}

impl VertexAuth {
    pub fn new(project_id: String, location: String, static_token: Option<String>) -> Self {
        Self {
            project_id,
            location,
            static_token,
            cached: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.gcp_project_id.clone(),
            config.gcp_location.clone(),
            config.gcp_access_token.clone(),
        )
    }

    /// Publisher model endpoint, e.g. `...:predict`
    pub fn endpoint(&self, model_id: &str, method: &str) -> String {
        format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{project}/locations/{loc}/publishers/google/models/{model_id}:{method}",
            loc = self.location,
            project = self.project_id,
        )
    }

    pub async fn access_token(&self) -> Result<String, GenerationFailure> {
        if let Some(token) = &self.static_token {
            if token.trim().is_empty() {
                return Err(GenerationFailure::new(
                    FailureReason::Unauthorized,
                    "GCP_ACCESS_TOKEN is empty",
                ));
            }
            return Ok(token.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some((token, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < TOKEN_REFRESH_AFTER {
                return Ok(token.clone());
            }
        }

        info!("Fetching Vertex AI access token via gcloud");
        let output = Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| {
                GenerationFailure::new(
                    FailureReason::Unauthorized,
                    format!("gcloud not available and GCP_ACCESS_TOKEN unset: {e}"),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerationFailure::new(
                FailureReason::Unauthorized,
                format!("gcloud auth print-access-token failed: {}", stderr.trim()),
            ));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(GenerationFailure::new(
                FailureReason::Unauthorized,
                "gcloud returned an empty access token",
            ));
        }

        debug!("Cached Vertex AI access token");
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    /// Drop a cached token after the provider rejected it
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
