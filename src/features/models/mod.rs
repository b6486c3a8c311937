//! # Image Generation Models
//!
//! Uniform adapters over the external image providers, a static table of the
//! models this tool knows about, and the failure classification the
//! orchestrator uses to choose between retry and fallback.
//!
//! - **Version**: 2.0.0
//! - **Since**: 0.2.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 2.0.0: Replicate Flux and Vertex Imagen adapters behind `GenerationModel`
//! - 1.0.0: Initial release with a single provider

pub mod flux;
pub mod imagen;
pub mod vertex;

#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::{Config, HeroError, ImageSize};

pub use flux::FluxModel;
pub use imagen::ImagenModel;
pub use vertex::VertexAuth;

/// Which provider API a registered model talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCapability {
    /// Replicate predictions API
    Replicate,
    /// Google Vertex AI Imagen `:predict`
    VertexImagen,
}

/// Static registry entry for a model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    /// Identifier callers select the model by
    pub name: &'static str,
    pub display_name: &'static str,
    /// USD charged per generated image
    pub cost_per_image: f64,
    pub capability: ProviderCapability,
    /// Model identifier on the provider side
    pub provider_model_id: &'static str,
}

/// Every model this tool can drive
pub static MODEL_DESCRIPTORS: &[ModelDescriptor] = &[
    ModelDescriptor {
        name: "flux-pro",
        display_name: "Flux Pro",
        cost_per_image: 0.055,
        capability: ProviderCapability::Replicate,
        provider_model_id: "black-forest-labs/flux-1.1-pro",
    },
    ModelDescriptor {
        name: "flux-dev",
        display_name: "Flux Dev",
        cost_per_image: 0.020,
        capability: ProviderCapability::Replicate,
        provider_model_id: "black-forest-labs/flux-dev",
    },
    ModelDescriptor {
        name: "flux-schnell",
        display_name: "Flux Schnell",
        cost_per_image: 0.010,
        capability: ProviderCapability::Replicate,
        provider_model_id: "black-forest-labs/flux-schnell",
    },
    ModelDescriptor {
        name: "imagen",
        display_name: "Imagen",
        cost_per_image: 0.020,
        capability: ProviderCapability::VertexImagen,
        provider_model_id: "imagegeneration@006",
    },
];

/// Look up a registered model by name
pub fn descriptor(name: &str) -> Option<&'static ModelDescriptor> {
    MODEL_DESCRIPTORS.iter().find(|d| d.name == name)
}

/// A generated image written to disk
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// File stem of the written image
    pub id: String,
    pub path: PathBuf,
    pub model: String,
    pub size: ImageSize,
}

/// Whether a failure is worth retrying on the same model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Network,
    RateLimited,
    ServerError,
    Unauthorized,
    InvalidInput,
    ContentRejected,
    MalformedResponse,
    /// Local disk I/O while saving the image
    Resource,
}

impl FailureReason {
    pub fn kind(&self) -> FailureKind {
        match self {
            FailureReason::Timeout
            | FailureReason::Network
            | FailureReason::RateLimited
            | FailureReason::ServerError
            | FailureReason::MalformedResponse
            | FailureReason::Resource => FailureKind::Transient,
            FailureReason::Unauthorized
            | FailureReason::InvalidInput
            | FailureReason::ContentRejected => FailureKind::Permanent,
        }
    }
}

/// A failed generation call, classified by the adapter that made it
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason:?}: {message}")]
pub struct GenerationFailure {
    pub reason: FailureReason,
    pub message: String,
    /// The provider charged for this call despite the failure
    pub billed: bool,
}

impl GenerationFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            billed: false,
        }
    }

    pub fn billed(mut self) -> Self {
        self.billed = true;
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.reason.kind()
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Classify a transport-level reqwest error
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        let reason = if e.is_timeout() {
            FailureReason::Timeout
        } else if let Some(status) = e.status() {
            classify_status(status)
        } else if e.is_decode() {
            FailureReason::MalformedResponse
        } else {
            FailureReason::Network
        };
        Self::new(reason, e.to_string())
    }

    /// Classify a non-success HTTP response
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let snippet: String = body.chars().take(300).collect();
        Self::new(classify_status(status), format!("HTTP {status}: {snippet}"))
    }
}

/// Map an HTTP status to a failure reason
pub fn classify_status(status: StatusCode) -> FailureReason {
    match status.as_u16() {
        408 => FailureReason::Timeout,
        429 => FailureReason::RateLimited,
        401 | 403 => FailureReason::Unauthorized,
        400 | 404 | 413 | 422 => FailureReason::InvalidInput,
        s if s >= 500 => FailureReason::ServerError,
        _ => FailureReason::InvalidInput,
    }
}

/// Contract every image provider adapter implements
#[async_trait]
pub trait GenerationModel: Send + Sync {
    /// Registry name, e.g. `flux-pro`
    fn name(&self) -> &str;

    /// Fixed USD cost per generated image
    fn cost_per_image(&self) -> f64;

    /// Generate one image and write it to `destination`
    async fn generate(
        &self,
        prompt: &str,
        size: ImageSize,
        destination: &Path,
    ) -> Result<Artifact, GenerationFailure>;
}

/// Write image bytes to the destination. The provider already charged for them,
/// so a local write failure is a billed resource failure.
pub async fn write_artifact(
    bytes: &[u8],
    destination: &Path,
    model: &str,
    size: ImageSize,
) -> Result<Artifact, GenerationFailure> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            GenerationFailure::new(
                FailureReason::Resource,
                format!("cannot create {}: {e}", parent.display()),
            )
            .billed()
        })?;
    }

    tokio::fs::write(destination, bytes).await.map_err(|e| {
        GenerationFailure::new(
            FailureReason::Resource,
            format!("cannot write {}: {e}", destination.display()),
        )
        .billed()
    })?;

    debug!(
        "Saved image | Model: {} | Bytes: {} | Path: {}",
        model,
        bytes.len(),
        destination.display()
    );

    let id = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Ok(Artifact {
        id,
        path: destination.to_path_buf(),
        model: model.to_string(),
        size,
    })
}

/// Live adapters keyed by registry name
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn GenerationModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an adapter for every descriptor in the static table
    pub fn from_config(config: &Config) -> Result<Self, HeroError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| HeroError::Configuration(format!("Failed to build HTTP client: {e}")))?;
        let auth = Arc::new(VertexAuth::from_config(config));

        let mut registry = Self::new();
        for desc in MODEL_DESCRIPTORS {
            let model: Arc<dyn GenerationModel> = match desc.capability {
                ProviderCapability::Replicate => Arc::new(FluxModel::new(
                    desc,
                    client.clone(),
                    config.replicate_api_token.clone(),
                )),
                ProviderCapability::VertexImagen => {
                    Arc::new(ImagenModel::new(desc, client.clone(), auth.clone()))
                }
            };
            registry = registry.register(model);
        }
        Ok(registry)
    }

    pub fn register(mut self, model: Arc<dyn GenerationModel>) -> Self {
        self.models.insert(model.name().to_string(), model);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn GenerationModel>, HeroError> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| HeroError::UnknownModel(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_lookup() {
        let pro = descriptor("flux-pro").unwrap();
        assert_eq!(pro.cost_per_image, 0.055);
        assert_eq!(pro.capability, ProviderCapability::Replicate);

        assert_eq!(descriptor("flux-dev").unwrap().cost_per_image, 0.020);
        assert_eq!(descriptor("flux-schnell").unwrap().cost_per_image, 0.010);
        assert_eq!(
            descriptor("imagen").unwrap().capability,
            ProviderCapability::VertexImagen
        );
        assert!(descriptor("dall-e-3").is_none());
    }

    #[test]
    fn test_descriptor_names_unique() {
        let mut names: Vec<_> = MODEL_DESCRIPTORS.iter().map(|d| d.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), MODEL_DESCRIPTORS.len());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS).kind(), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY).kind(), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), FailureReason::Timeout);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED).kind(), FailureKind::Permanent);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureReason::Unauthorized);
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), FailureReason::InvalidInput);
    }

    #[test]
    fn test_failure_is_unbilled_by_default() {
        let failure = GenerationFailure::new(FailureReason::Timeout, "slow");
        assert!(!failure.billed);
        assert!(failure.is_transient());
        assert!(failure.billed().billed);
    }

    #[test]
    fn test_registry_from_config_covers_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::core::config::test_config(dir.path());
        let registry = ModelRegistry::from_config(&config).unwrap();

        assert_eq!(registry.names(), vec!["flux-dev", "flux-pro", "flux-schnell", "imagen"]);
        let imagen = registry.get("imagen").unwrap();
        assert_eq!(imagen.cost_per_image(), 0.020);
        assert!(matches!(registry.get("midjourney"), Err(HeroError::UnknownModel(_))));
    }

    #[tokio::test]
    async fn test_write_artifact_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/run-1.png");

        let artifact = write_artifact(b"png", &dest, "flux-pro", ImageSize::new(8, 8))
            .await
            .unwrap();

        assert_eq!(artifact.id, "run-1");
        assert_eq!(std::fs::read(&dest).unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_write_artifact_failure_is_billed_resource() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let err = write_artifact(b"png", &blocker.join("img.png"), "imagen", ImageSize::new(8, 8))
            .await
            .unwrap_err();

        assert_eq!(err.reason, FailureReason::Resource);
        assert!(err.billed);
        assert!(err.is_transient());
    }
}
