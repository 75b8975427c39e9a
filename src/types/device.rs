//! Device types
//!
//! Identifies compute devices capable of hosting a vision instance.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a compute device.
///
/// The CPU is always present; accelerators are addressed by ordinal.
/// `Cpu` sorts before any `Gpu`, which gives device listings a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceId {
    /// The general-purpose host processor
    Cpu,
    /// A CUDA accelerator, by index
    Gpu(u32),
}

impl DeviceId {
    /// Whether this is an accelerator rather than the host processor
    pub fn is_accelerator(&self) -> bool {
        matches!(self, DeviceId::Gpu(_))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Cpu => write!(f, "cpu"),
            DeviceId::Gpu(idx) => write!(f, "gpu{}", idx),
        }
    }
}

/// Point-in-time snapshot of a compute device.
///
/// Never persisted; always re-queried from the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Human-readable device name (e.g. "NVIDIA GeForce RTX 3080")
    pub name: String,
    /// Total device memory in MiB
    pub memory_total_mb: u64,
    /// Free device memory in MiB at query time
    pub memory_free_mb: u64,
}
