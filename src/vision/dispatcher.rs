//! Inference dispatch
//!
//! Executes a single inference call against a checked-out instance with a
//! caller-configurable timeout. Failures are typed, never retried here:
//! inference failures are usually deterministic given the same input and
//! device memory state, so retry is a caller decision.

use std::time::Duration;
use thiserror::Error;

use crate::types::image::{Caption, CaptionOptions};
use crate::vision::registry::InstanceHandle;

/// Dispatch errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference failed: {reason}")]
    Failed { reason: String },
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs single inference calls.
///
/// Imposes no concurrency cap of its own; the scheduler bounds calls per
/// instance to keep device memory pressure in check.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Run one caption pass over `image` on the instance behind `handle`.
    ///
    /// A timeout does not unload the instance: a slow call is not evidence
    /// of a broken instance.
    pub async fn infer(
        &self,
        handle: &InstanceHandle,
        image: &[u8],
        options: &CaptionOptions,
    ) -> Result<Caption, InferenceError> {
        let call = handle.instance().caption(image, options.need_objects);

        match tokio::time::timeout(options.timeout, call).await {
            Ok(Ok(caption)) => {
                tracing::debug!(
                    "Inference on {} produced {} chars, {} objects",
                    handle.device(),
                    caption.text.len(),
                    caption.objects.len()
                );
                Ok(caption)
            }
            Ok(Err(e)) => {
                tracing::warn!("Inference on {} failed: {}", handle.device(), e);
                Err(InferenceError::Failed {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!(
                    "Inference on {} timed out after {:?}",
                    handle.device(),
                    options.timeout
                );
                Err(InferenceError::Timeout(options.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::device::{Device, DeviceId};
    use crate::vision::backend::{BackendError, ModelSpec, VisionBackend, VisionInstance};
    use crate::vision::registry::VisionRegistry;
    use async_trait::async_trait;
    use std::sync::Arc;

    enum Behavior {
        Ok,
        Fail,
        Hang,
    }

    struct TestInstance(Behavior);

    #[async_trait]
    impl VisionInstance for TestInstance {
        async fn caption(&self, _image: &[u8], need_objects: bool) -> Result<Caption, BackendError> {
            match self.0 {
                Behavior::Ok => Ok(Caption {
                    text: "a red kite over a field".to_string(),
                    objects: if need_objects {
                        vec!["kite".to_string(), "field".to_string()]
                    } else {
                        vec![]
                    },
                }),
                Behavior::Fail => Err(BackendError::Inference("malformed input".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    struct TestBackend(fn() -> Behavior);

    #[async_trait]
    impl VisionBackend for TestBackend {
        async fn load(
            &self,
            _device: &Device,
            _spec: &ModelSpec,
        ) -> Result<Arc<dyn VisionInstance>, BackendError> {
            Ok(Arc::new(TestInstance((self.0)())))
        }
    }

    async fn handle_with(behavior: fn() -> Behavior) -> InstanceHandle {
        let registry = VisionRegistry::new(Arc::new(TestBackend(behavior)));
        let device = Device {
            id: DeviceId::Cpu,
            name: "CPU".to_string(),
            memory_total_mb: 0,
            memory_free_mb: 0,
        };
        registry
            .load(&device, &ModelSpec::default())
            .await
            .unwrap()
            .handle()
    }

    #[tokio::test]
    async fn test_infer_success() {
        let handle = handle_with(|| Behavior::Ok).await;
        let caption = Dispatcher::new()
            .infer(&handle, b"jpeg bytes", &CaptionOptions::default())
            .await
            .unwrap();
        assert_eq!(caption.text, "a red kite over a field");
        assert_eq!(caption.objects.len(), 2);
    }

    #[tokio::test]
    async fn test_infer_without_objects() {
        let handle = handle_with(|| Behavior::Ok).await;
        let opts = CaptionOptions {
            need_objects: false,
            ..Default::default()
        };
        let caption = Dispatcher::new().infer(&handle, b"x", &opts).await.unwrap();
        assert!(caption.objects.is_empty());
    }

    #[tokio::test]
    async fn test_infer_failure_is_typed() {
        let handle = handle_with(|| Behavior::Fail).await;
        let err = Dispatcher::new()
            .infer(&handle, b"x", &CaptionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Failed { .. }));
        assert!(err.to_string().contains("malformed input"));
    }

    #[tokio::test]
    async fn test_infer_timeout() {
        let handle = handle_with(|| Behavior::Hang).await;
        let opts = CaptionOptions {
            need_objects: true,
            timeout: Duration::from_millis(20),
        };
        let err = Dispatcher::new().infer(&handle, b"x", &opts).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
    }
}
