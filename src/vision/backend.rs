//! Vision backend seam
//!
//! The actual neural forward pass is an opaque capability behind these
//! traits: bytes in, captions out, consuming device memory and wall-clock
//! time. Production backends wrap a real model runtime; tests use fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::types::device::Device;
use crate::types::image::Caption;

/// What to load onto a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier understood by the backend
    pub name: String,
    /// Approximate resident footprint per instance, in MiB
    pub footprint_mb: u64,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            name: "caption-base".to_string(),
            footprint_mb: 2048,
        }
    }
}

/// Backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("load failed: {0}")]
    LoadFailed(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// One resident copy of the inference capability, pinned to one device.
///
/// Implementations must tolerate concurrent `caption` calls on the same
/// instance; callers bound the concurrency, not the instance.
#[async_trait]
pub trait VisionInstance: Send + Sync {
    /// Run one caption pass over raw image bytes.
    async fn caption(&self, image: &[u8], need_objects: bool) -> Result<Caption, BackendError>;
}

/// Factory for vision instances.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Bring one instance up on the given device.
    ///
    /// Device memory is allocated here and released when the returned
    /// instance is dropped.
    async fn load(
        &self,
        device: &Device,
        spec: &ModelSpec,
    ) -> Result<Arc<dyn VisionInstance>, BackendError>;
}
