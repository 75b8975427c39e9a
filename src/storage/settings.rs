//! Settings storage
//!
//! Manages persistence of service settings: source API keys, pipeline
//! concurrency bounds, and vision instance sizing.

use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiveSettings {
    /// Pixabay API key; empty disables the source
    #[serde(default)]
    pub pixabay_key: String,
    /// Pexels API key; empty disables the source
    #[serde(default)]
    pub pexels_key: String,
    /// Unsplash access key; empty disables the source
    #[serde(default)]
    pub unsplash_key: String,
    /// Directory where originals and the metadata index are stored
    pub images_directory: PathBuf,
    /// Concurrent network fetches per batch download stage
    pub download_concurrency: usize,
    /// Bounded retries for transient download failures
    pub download_retries: u32,
    /// Wall-clock budget for a single inference call, in seconds
    pub inference_timeout_secs: u64,
    /// Also detect object labels during analysis
    pub need_objects: bool,
    /// Model identifier handed to the vision backend
    pub model_name: String,
    /// Approximate resident footprint per instance, in MiB
    pub model_footprint_mb: u64,
    /// Minimum free accelerator memory to consider a device usable, in MiB
    pub min_free_vram_mb: u64,
}

impl Default for HiveSettings {
    fn default() -> Self {
        Self {
            pixabay_key: String::new(),
            pexels_key: String::new(),
            unsplash_key: String::new(),
            images_directory: get_data_dir()
                .ok()
                .map(|d| d.join("images"))
                .unwrap_or_else(|| PathBuf::from("./images")),
            download_concurrency: 4,
            download_retries: 2,
            inference_timeout_secs: 60,
            need_objects: true,
            model_name: "caption-base".to_string(),
            model_footprint_mb: 2048,
            // Roughly one instance footprint plus headroom
            min_free_vram_mb: 2560,
        }
    }
}

impl HiveSettings {
    /// Clamp all values into acceptable ranges.
    pub fn validate(&mut self) {
        self.download_concurrency = self.download_concurrency.clamp(1, 16);
        self.download_retries = self.download_retries.min(5);
        self.inference_timeout_secs = self.inference_timeout_secs.clamp(5, 600);

        if self.model_name.trim().is_empty() {
            self.model_name = "caption-base".to_string();
        }

        if self.model_footprint_mb == 0 {
            self.model_footprint_mb = 2048;
        }

        // A device that cannot hold one instance is never usable.
        if self.min_free_vram_mb < self.model_footprint_mb {
            self.min_free_vram_mb = self.model_footprint_mb;
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted.
pub fn load_settings() -> HiveSettings {
    match load_settings_internal() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            HiveSettings::default()
        }
    }
}

fn load_settings_internal() -> Result<HiveSettings, StorageError> {
    let path = get_settings_path()?;

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(HiveSettings::default());
    }

    let json = fs::read_to_string(&path)?;
    let mut settings: HiveSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from disk");
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &HiveSettings) -> Result<(), StorageError> {
    let path = get_settings_path()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to disk");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = HiveSettings::default();
        assert_eq!(settings.download_concurrency, 4);
        assert_eq!(settings.download_retries, 2);
        assert_eq!(settings.inference_timeout_secs, 60);
        assert!(settings.need_objects);
        assert!(settings.pixabay_key.is_empty());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = HiveSettings::default();

        settings.download_concurrency = 0;
        settings.validate();
        assert_eq!(settings.download_concurrency, 1);

        settings.download_concurrency = 100;
        settings.validate();
        assert_eq!(settings.download_concurrency, 16);

        settings.inference_timeout_secs = 0;
        settings.validate();
        assert_eq!(settings.inference_timeout_secs, 5);

        settings.model_name = "  ".to_string();
        settings.validate();
        assert_eq!(settings.model_name, "caption-base");

        settings.min_free_vram_mb = 1;
        settings.validate();
        assert!(settings.min_free_vram_mb >= settings.model_footprint_mb);
    }

    #[test]
    fn test_settings_serialization() {
        let settings = HiveSettings::default();
        let json = serde_json::to_string_pretty(&settings).unwrap();
        let mut loaded: HiveSettings = serde_json::from_str(&json).unwrap();
        loaded.validate();

        assert_eq!(settings.download_concurrency, loaded.download_concurrency);
        assert_eq!(settings.model_name, loaded.model_name);
    }

    #[test]
    fn test_missing_keys_default_empty() {
        // Keys were added over time; older settings files omit them.
        let json = r#"{
            "images_directory": "/tmp/images",
            "download_concurrency": 2,
            "download_retries": 1,
            "inference_timeout_secs": 30,
            "need_objects": false,
            "model_name": "caption-base",
            "model_footprint_mb": 2048,
            "min_free_vram_mb": 2560
        }"#;
        let settings: HiveSettings = serde_json::from_str(json).unwrap();
        assert!(settings.pixabay_key.is_empty());
        assert!(settings.unsplash_key.is_empty());
    }
}
