//! # Imagen via Vertex AI
//!
//! Vertex AI only accepts a handful of aspect ratios, so the requested size is
//! mapped to the closest one and the provider picks the pixel dimensions.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use super::{
    write_artifact, Artifact, FailureReason, GenerationFailure, GenerationModel, ModelDescriptor,
    VertexAuth,
};
use crate::core::ImageSize;

/// Aspect ratios Imagen supports, with their width/height ratio
const ASPECT_RATIOS: &[(&str, f64)] = &[
    ("1:1", 1.0),
    ("3:4", 0.75),
    ("4:3", 1.333),
    ("9:16", 0.5625),
    ("16:9", 1.778),
];

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<ImagePrediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImagePrediction {
    bytes_base64_encoded: Option<String>,
}

pub struct ImagenModel {
    descriptor: &'static ModelDescriptor,
    client: reqwest::Client,
    auth: Arc<VertexAuth>,
}

impl ImagenModel {
    pub fn new(
        descriptor: &'static ModelDescriptor,
        client: reqwest::Client,
        auth: Arc<VertexAuth>,
    ) -> Self {
        Self {
            descriptor,
            client,
            auth,
        }
    }
}

/// Closest supported aspect ratio for the requested size
pub fn closest_aspect_ratio(size: ImageSize) -> &'static str {
    let ratio = size.width as f64 / size.height as f64;
    ASPECT_RATIOS
        .iter()
        .min_by(|a, b| (a.1 - ratio).abs().total_cmp(&(b.1 - ratio).abs()))
        .map(|(name, _)| *name)
        .unwrap_or("1:1")
}

fn decode_first_image(response: PredictResponse) -> Result<Vec<u8>, GenerationFailure> {
    let encoded = response
        .predictions
        .into_iter()
        .find_map(|p| p.bytes_base64_encoded)
        // Vertex drops filtered images from the response instead of failing
        .ok_or_else(|| {
            GenerationFailure::new(
                FailureReason::ContentRejected,
                "Imagen returned no image; the prompt was likely filtered",
            )
        })?;

    BASE64.decode(encoded.as_bytes()).map_err(|e| {
        GenerationFailure::new(
            FailureReason::MalformedResponse,
            format!("invalid base64 image payload: {e}"),
        )
        .billed()
    })
}

#[async_trait]
impl GenerationModel for ImagenModel {
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
        let aspect_ratio = closest_aspect_ratio(size);
        info!(
            "Vertex AI predict | Model: {} | Aspect: {}",
            self.descriptor.provider_model_id, aspect_ratio
        );

        let token = self.auth.access_token().await?;
        let url = self.auth.endpoint(self.descriptor.provider_model_id, "predict");
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": { "sampleCount": 1, "aspectRatio": aspect_ratio },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationFailure::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.auth.invalidate().await;
            }
            warn!("Imagen request rejected: HTTP {status}");
            return Err(GenerationFailure::from_status(status, &body));
        }

        let parsed = response.json::<PredictResponse>().await.map_err(|e| {
            GenerationFailure::new(
                FailureReason::MalformedResponse,
                format!("unexpected Vertex AI response: {e}"),
            )
            .billed()
        })?;

        let bytes = decode_first_image(parsed)?;
        write_artifact(&bytes, destination, self.name(), size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::models::{descriptor, FailureKind};

    #[test]
    fn test_aspect_ratio_mapping() {
        assert_eq!(closest_aspect_ratio(ImageSize::new(1920, 1080)), "16:9");
        assert_eq!(closest_aspect_ratio(ImageSize::new(800, 450)), "16:9");
        assert_eq!(closest_aspect_ratio(ImageSize::new(1024, 1024)), "1:1");
        assert_eq!(closest_aspect_ratio(ImageSize::new(1080, 1920)), "9:16");
        assert_eq!(closest_aspect_ratio(ImageSize::new(1200, 900)), "4:3");
        assert_eq!(closest_aspect_ratio(ImageSize::new(900, 1200)), "3:4");
    }

    #[test]
    fn test_imagen_cost() {
        let auth = Arc::new(VertexAuth::new("p".into(), "l".into(), Some("t".into())));
        let model = ImagenModel::new(descriptor("imagen").unwrap(), reqwest::Client::new(), auth);
        assert_eq!(model.name(), "imagen");
        assert_eq!(model.cost_per_image(), 0.020);
    }

    #[test]
    fn test_decode_first_image() {
        let response: PredictResponse = serde_json::from_value(json!({
            "predictions": [{ "bytesBase64Encoded": BASE64.encode(b"png-bytes"), "mimeType": "image/png" }]
        }))
        .unwrap();
        assert_eq!(decode_first_image(response).unwrap(), b"png-bytes");
    }

    #[test]
    fn test_filtered_response_is_permanent() {
        let response: PredictResponse = serde_json::from_value(json!({})).unwrap();
        let err = decode_first_image(response).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert!(!err.billed);
    }

    #[test]
    fn test_corrupt_payload_is_transient() {
        let response: PredictResponse = serde_json::from_value(json!({
            "predictions": [{ "bytesBase64Encoded": "***not base64***" }]
        }))
        .unwrap();
        let err = decode_first_image(response).unwrap_err();
        assert_eq!(err.reason, FailureReason::MalformedResponse);
        assert!(err.billed);
    }
}
