//! Device inventory
//!
//! Enumerates available compute devices and their free/total memory.
//! Pure point-in-time queries: nothing here holds state, and a missing
//! compute runtime means "no accelerators present", never an error.

use std::process::Command;

use crate::types::device::{Device, DeviceId};

/// Queries available compute devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceInventory;

impl DeviceInventory {
    pub fn new() -> Self {
        Self
    }

    /// List all devices: the CPU first, then accelerators by ordinal.
    pub fn list_devices(&self) -> Vec<Device> {
        let mut devices = vec![cpu_device()];
        devices.extend(detect_gpus());
        devices
    }

    /// Free memory in MiB for one device, re-queried on every call.
    ///
    /// `None` when the device is not present.
    pub fn free_memory_mb(&self, id: DeviceId) -> Option<u64> {
        self.list_devices()
            .into_iter()
            .find(|d| d.id == id)
            .map(|d| d.memory_free_mb)
    }

    /// Pick the best device to host a new instance: the accelerator with
    /// the most free memory above `min_free_mb`, falling back to the CPU.
    pub fn recommend(&self, min_free_mb: u64) -> Device {
        let devices = self.list_devices();
        let best_gpu = devices
            .iter()
            .filter(|d| d.id.is_accelerator() && d.memory_free_mb >= min_free_mb)
            .max_by_key(|d| d.memory_free_mb)
            .cloned();

        match best_gpu {
            Some(gpu) => {
                tracing::info!(
                    "Recommending {} ({}, {} MiB free)",
                    gpu.id,
                    gpu.name,
                    gpu.memory_free_mb
                );
                gpu
            }
            None => {
                tracing::info!("No accelerator with {} MiB free, using CPU", min_free_mb);
                devices.into_iter().next().unwrap_or_else(cpu_device)
            }
        }
    }
}

fn cpu_device() -> Device {
    let (total_mb, free_mb) = host_memory_mb().unwrap_or((0, 0));
    Device {
        id: DeviceId::Cpu,
        name: "CPU".to_string(),
        memory_total_mb: total_mb,
        memory_free_mb: free_mb,
    }
}

/// Detect NVIDIA accelerators via nvidia-smi (best effort).
fn detect_gpus() -> Vec<Device> {
    let output = match Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output()
    {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_nvidia_smi(&stdout)
}

fn parse_nvidia_smi(stdout: &str) -> Vec<Device> {
    let mut devices = Vec::new();

    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 4 {
            continue;
        }

        let index = match parts[0].parse::<u32>() {
            Ok(idx) => idx,
            Err(_) => continue,
        };
        let total_mb = parts[2].parse::<u64>().unwrap_or(0);
        let free_mb = parts[3].parse::<u64>().unwrap_or(0);

        devices.push(Device {
            id: DeviceId::Gpu(index),
            name: parts[1].to_string(),
            memory_total_mb: total_mb,
            memory_free_mb: free_mb,
        });
    }

    devices.sort_by_key(|d| d.id);
    devices
}

/// Host RAM (total, available) in MiB via /proc/meminfo, when readable.
fn host_memory_mb() -> Option<(u64, u64)> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut available_kb = None;

    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().split_whitespace().next()?.parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().split_whitespace().next()?.parse::<u64>().ok();
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }

    Some((total_kb? / 1024, available_kb.unwrap_or(0) / 1024))
}
