//! Vision instance registry
//!
//! Owns every loaded vision instance, keyed by device. Enforces at most
//! one instance per device, serializes concurrent loads on the same device
//! through a per-device token, and drains the in-flight reference count
//! before an unload releases device memory. All device-instance state
//! mutations funnel through this registry; nothing else touches it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;

use crate::types::device::{Device, DeviceId};
use crate::vision::backend::{ModelSpec, VisionBackend, VisionInstance};

/// Load state of one device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Unloaded => "unloaded",
            InstanceState::Loading => "loading",
            InstanceState::Ready => "ready",
            InstanceState::Unloading => "unloading",
            InstanceState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no ready instance on {0}")]
    NotLoaded(DeviceId),
    #[error("load failed on {device}: {reason}")]
    LoadFailed { device: DeviceId, reason: String },
}

/// Result of a successful `load` call.
///
/// A load finding an existing ready instance is idempotent by design, not
/// an error: the caller receives the now-ready handle either way and can
/// branch on which path was taken.
pub enum LoadOutcome {
    /// This call performed the load
    Loaded(InstanceHandle),
    /// A ready instance was already present on the device
    AlreadyLoaded(InstanceHandle),
}

impl LoadOutcome {
    pub fn handle(self) -> InstanceHandle {
        match self {
            LoadOutcome::Loaded(handle) | LoadOutcome::AlreadyLoaded(handle) => handle,
        }
    }
}

/// Point-in-time view of one device slot, for observability.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceStatus {
    pub device: DeviceId,
    pub state: InstanceState,
    pub footprint_mb: u64,
    /// In-flight inference calls holding this instance
    pub refcount: usize,
    pub loaded_at: Option<DateTime<Utc>>,
}

struct SlotInner {
    state: InstanceState,
    instance: Option<Arc<dyn VisionInstance>>,
    refcount: usize,
    footprint_mb: u64,
    loaded_at: Option<DateTime<Utc>>,
}

struct Slot {
    /// Per-device token: held for the whole of a load or unload, so
    /// concurrent loads on one device serialize and never race the
    /// allocation.
    load_token: tokio::sync::Mutex<()>,
    inner: Mutex<SlotInner>,
    /// Signalled whenever the refcount drops to zero
    drained: Notify,
}

impl Slot {
    fn new() -> Self {
        Self {
            load_token: tokio::sync::Mutex::new(()),
            inner: Mutex::new(SlotInner {
                state: InstanceState::Unloaded,
                instance: None,
                refcount: 0,
                footprint_mb: 0,
                loaded_at: None,
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        // A poisoned slot lock only means a panic mid-update elsewhere;
        // the state itself is still coherent enough to read.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Scoped checkout of a ready instance.
///
/// Holding a handle keeps the instance pinned: `unload` waits until every
/// handle on the device is dropped before releasing device memory.
pub struct InstanceHandle {
    device: DeviceId,
    slot: Arc<Slot>,
    instance: Arc<dyn VisionInstance>,
}

impl InstanceHandle {
    fn new(device: DeviceId, slot: Arc<Slot>, instance: Arc<dyn VisionInstance>) -> Self {
        Self {
            device,
            slot,
            instance,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn instance(&self) -> &Arc<dyn VisionInstance> {
        &self.instance
    }
}

impl Clone for InstanceHandle {
    fn clone(&self) -> Self {
        self.slot.lock().refcount += 1;
        Self {
            device: self.device,
            slot: Arc::clone(&self.slot),
            instance: Arc::clone(&self.instance),
        }
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        let remaining = {
            let mut inner = self.slot.lock();
            inner.refcount -= 1;
            inner.refcount
        };
        if remaining == 0 {
            self.slot.drained.notify_waiters();
        }
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("device", &self.device)
            .finish()
    }
}

/// The lock-guarded device → instance table.
pub struct VisionRegistry {
    backend: Arc<dyn VisionBackend>,
    slots: DashMap<DeviceId, Arc<Slot>>,
}

impl VisionRegistry {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, device: DeviceId) -> Arc<Slot> {
        self.slots
            .entry(device)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Load an instance onto `device`.
    ///
    /// Concurrent loads on the same device serialize on the per-device
    /// token: the second caller blocks until the first resolves, then
    /// observes [`LoadOutcome::AlreadyLoaded`] with the now-ready handle.
    /// Loads on different devices proceed fully in parallel.
    ///
    /// A previously failed load is not retried implicitly; this call is
    /// the explicit retry path.
    pub async fn load(
        &self,
        device: &Device,
        spec: &ModelSpec,
    ) -> Result<LoadOutcome, RegistryError> {
        let slot = self.slot(device.id);
        let _token = slot.load_token.lock().await;

        // Under the token the state can only be Unloaded, Failed, or Ready:
        // Loading and Unloading both resolve before the token is released.
        {
            let mut inner = slot.lock();
            if inner.state == InstanceState::Ready {
                if let Some(instance) = inner.instance.clone() {
                    inner.refcount += 1;
                    drop(inner);
                    tracing::debug!("Load on {}: instance already ready", device.id);
                    return Ok(LoadOutcome::AlreadyLoaded(InstanceHandle::new(
                        device.id,
                        Arc::clone(&slot),
                        instance,
                    )));
                }
            }
            inner.state = InstanceState::Loading;
        }

        tracing::info!(
            "Loading model '{}' on {} ({} MiB footprint)",
            spec.name,
            device.id,
            spec.footprint_mb
        );

        match self.backend.load(device, spec).await {
            Ok(instance) => {
                let handle = {
                    let mut inner = slot.lock();
                    inner.state = InstanceState::Ready;
                    inner.instance = Some(Arc::clone(&instance));
                    inner.footprint_mb = spec.footprint_mb;
                    inner.loaded_at = Some(Utc::now());
                    inner.refcount += 1;
                    InstanceHandle::new(device.id, Arc::clone(&slot), instance)
                };
                tracing::info!("Instance ready on {}", device.id);
                Ok(LoadOutcome::Loaded(handle))
            }
            Err(e) => {
                {
                    let mut inner = slot.lock();
                    inner.state = InstanceState::Failed;
                    inner.instance = None;
                }
                tracing::error!("Load failed on {}: {}", device.id, e);
                Err(RegistryError::LoadFailed {
                    device: device.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Check out the ready instance on `device`.
    ///
    /// Fails with [`RegistryError::NotLoaded`] unless the slot is `Ready`
    /// at acquisition time; never waits for a concurrent load.
    pub fn acquire(&self, device: DeviceId) -> Result<InstanceHandle, RegistryError> {
        let slot = self
            .slots
            .get(&device)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::NotLoaded(device))?;

        let mut inner = slot.lock();
        match (&inner.state, inner.instance.clone()) {
            (InstanceState::Ready, Some(instance)) => {
                inner.refcount += 1;
                drop(inner);
                Ok(InstanceHandle::new(device, Arc::clone(&slot), instance))
            }
            _ => Err(RegistryError::NotLoaded(device)),
        }
    }

    /// Unload the instance on `device`, waiting for in-flight inference
    /// calls to drain before releasing the underlying resources.
    pub async fn unload(&self, device: DeviceId) -> Result<(), RegistryError> {
        let slot = self
            .slots
            .get(&device)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::NotLoaded(device))?;

        let _token = slot.load_token.lock().await;

        {
            let mut inner = slot.lock();
            if inner.state != InstanceState::Ready {
                return Err(RegistryError::NotLoaded(device));
            }
            inner.state = InstanceState::Unloading;
        }

        // Graceful drain: wait for every outstanding handle to drop.
        loop {
            let notified = slot.drained.notified();
            if slot.lock().refcount == 0 {
                break;
            }
            tracing::debug!("Unload on {} waiting for in-flight calls", device);
            notified.await;
        }

        {
            let mut inner = slot.lock();
            inner.instance = None;
            inner.state = InstanceState::Unloaded;
            inner.footprint_mb = 0;
            inner.loaded_at = None;
        }

        tracing::info!("Instance on {} unloaded", device);
        Ok(())
    }

    /// Unload every ready instance. Best-effort: failures are collected
    /// per device rather than aborting the sweep.
    pub async fn unload_all(&self) -> Vec<(DeviceId, RegistryError)> {
        let mut devices: Vec<DeviceId> = self
            .slots
            .iter()
            .filter(|entry| entry.value().lock().state == InstanceState::Ready)
            .map(|entry| *entry.key())
            .collect();
        devices.sort();

        let mut failures = Vec::new();
        for device in devices {
            if let Err(e) = self.unload(device).await {
                // A slot that went away between the scan and the unload is
                // already in the state we wanted.
                if !matches!(e, RegistryError::NotLoaded(_)) {
                    failures.push((device, e));
                }
            }
        }
        failures
    }

    /// Ordered point-in-time snapshot of every slot. Never blocks on
    /// in-flight loads or inference.
    pub fn status(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self
            .slots
            .iter()
            .map(|entry| {
                let inner = entry.value().lock();
                InstanceStatus {
                    device: *entry.key(),
                    state: inner.state,
                    footprint_mb: inner.footprint_mb,
                    refcount: inner.refcount,
                    loaded_at: inner.loaded_at,
                }
            })
            .collect();
        statuses.sort_by_key(|s| s.device);
        statuses
    }

    /// Devices currently holding a ready instance, in order.
    pub fn ready_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .slots
            .iter()
            .filter(|entry| entry.value().lock().state == InstanceState::Ready)
            .map(|entry| *entry.key())
            .collect();
        devices.sort();
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::image::Caption;
    use crate::vision::backend::BackendError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeInstance;

    #[async_trait]
    impl VisionInstance for FakeInstance {
        async fn caption(&self, _image: &[u8], _need_objects: bool) -> Result<Caption, BackendError> {
            Ok(Caption {
                text: "a test image".to_string(),
                objects: vec![],
            })
        }
    }

    struct FakeBackend {
        loads: AtomicUsize,
        load_delay: Duration,
        fail: bool,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                load_delay: Duration::from_millis(0),
                fail: false,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                load_delay: delay,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                load_delay: Duration::from_millis(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl VisionBackend for FakeBackend {
        async fn load(
            &self,
            _device: &Device,
            _spec: &ModelSpec,
        ) -> Result<Arc<dyn VisionInstance>, BackendError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.load_delay.is_zero() {
                tokio::time::sleep(self.load_delay).await;
            }
            if self.fail {
                return Err(BackendError::LoadFailed("out of memory".to_string()));
            }
            Ok(Arc::new(FakeInstance))
        }
    }

    fn gpu(idx: u32) -> Device {
        Device {
            id: DeviceId::Gpu(idx),
            name: format!("Fake GPU {}", idx),
            memory_total_mb: 8192,
            memory_free_mb: 8192,
        }
    }

    #[tokio::test]
    async fn test_load_then_status_reports_ready() {
        let registry = VisionRegistry::new(FakeBackend::new());
        let outcome = registry.load(&gpu(0), &ModelSpec::default()).await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded(_)));

        let status = registry.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].device, DeviceId::Gpu(0));
        assert_eq!(status[0].state, InstanceState::Ready);
        assert!(status[0].loaded_at.is_some());
    }

    #[tokio::test]
    async fn test_unload_round_trip() {
        let registry = VisionRegistry::new(FakeBackend::new());
        drop(registry.load(&gpu(0), &ModelSpec::default()).await.unwrap().handle());

        registry.unload(DeviceId::Gpu(0)).await.unwrap();
        let status = registry.status();
        assert_eq!(status[0].state, InstanceState::Unloaded);
        assert_eq!(status[0].refcount, 0);

        assert!(matches!(
            registry.acquire(DeviceId::Gpu(0)),
            Err(RegistryError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_unload_not_loaded() {
        let registry = VisionRegistry::new(FakeBackend::new());
        assert!(matches!(
            registry.unload(DeviceId::Gpu(0)).await,
            Err(RegistryError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_loads_same_device_serialize() {
        let backend = FakeBackend::slow(Duration::from_millis(50));
        let registry = Arc::new(VisionRegistry::new(backend.clone()));

        let r1 = Arc::clone(&registry);
        let r2 = Arc::clone(&registry);
        let (a, b) = tokio::join!(
            async move { r1.load(&gpu(0), &ModelSpec::default()).await },
            async move { r2.load(&gpu(0), &ModelSpec::default()).await },
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        let fresh = outcomes
            .iter()
            .filter(|o| matches!(o, LoadOutcome::Loaded(_)))
            .count();
        let existing = outcomes
            .iter()
            .filter(|o| matches!(o, LoadOutcome::AlreadyLoaded(_)))
            .count();

        // Exactly one caller performed the load; the other observed it.
        assert_eq!(fresh, 1);
        assert_eq!(existing, 1);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_different_devices_parallel() {
        let backend = FakeBackend::slow(Duration::from_millis(50));
        let registry = Arc::new(VisionRegistry::new(backend.clone()));

        let start = std::time::Instant::now();
        let r1 = Arc::clone(&registry);
        let r2 = Arc::clone(&registry);
        let (a, b) = tokio::join!(
            async move { r1.load(&gpu(0), &ModelSpec::default()).await },
            async move { r2.load(&gpu(1), &ModelSpec::default()).await },
        );
        a.unwrap();
        b.unwrap();

        // Two serialized 50ms loads would take ~100ms.
        assert!(start.elapsed() < Duration::from_millis(95));
        assert_eq!(backend.loads.load(Ordering::SeqCst), 2);
        assert_eq!(registry.ready_devices().len(), 2);
    }

    #[tokio::test]
    async fn test_unload_waits_for_outstanding_handle() {
        let registry = Arc::new(VisionRegistry::new(FakeBackend::new()));
        drop(registry.load(&gpu(0), &ModelSpec::default()).await.unwrap().handle());

        let handle = registry.acquire(DeviceId::Gpu(0)).unwrap();

        let r = Arc::clone(&registry);
        let unload = tokio::spawn(async move { r.unload(DeviceId::Gpu(0)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!unload.is_finished());
        assert_eq!(registry.status()[0].state, InstanceState::Unloading);

        drop(handle);
        unload.await.unwrap().unwrap();
        assert_eq!(registry.status()[0].state, InstanceState::Unloaded);
    }

    #[tokio::test]
    async fn test_failed_load_requires_explicit_retry() {
        let registry = VisionRegistry::new(FakeBackend::failing());
        let err = registry.load(&gpu(0), &ModelSpec::default()).await;
        assert!(matches!(err, Err(RegistryError::LoadFailed { .. })));

        assert_eq!(registry.status()[0].state, InstanceState::Failed);
        // acquire never retries a failed load on the caller's behalf
        assert!(matches!(
            registry.acquire(DeviceId::Gpu(0)),
            Err(RegistryError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_unload_all_best_effort() {
        let registry = VisionRegistry::new(FakeBackend::new());
        drop(registry.load(&gpu(0), &ModelSpec::default()).await.unwrap().handle());
        drop(registry.load(&gpu(1), &ModelSpec::default()).await.unwrap().handle());

        let failures = registry.unload_all().await;
        assert!(failures.is_empty());
        assert!(registry.ready_devices().is_empty());

        // A second sweep over already-unloaded slots is a clean no-op.
        assert!(registry.unload_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_handle_clone_tracks_refcount() {
        let registry = VisionRegistry::new(FakeBackend::new());
        let handle = registry.load(&gpu(0), &ModelSpec::default()).await.unwrap().handle();
        let clone = handle.clone();

        assert_eq!(registry.status()[0].refcount, 2);
        drop(handle);
        assert_eq!(registry.status()[0].refcount, 1);
        drop(clone);
        assert_eq!(registry.status()[0].refcount, 0);
    }
}
