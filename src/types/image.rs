//! Image types
//!
//! Records for stored images, search results, and caption output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A stored image and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Stable opaque ID
    pub id: String,
    /// Source URL the image was fetched from
    pub url: String,
    /// Source site name (e.g. "Pixabay")
    pub source: String,
    /// Source-native ID, when the site provides one
    pub source_id: Option<String>,
    /// The search query that produced this image
    pub query: String,
    /// Local file path of the original, relative to the store root
    pub path: Option<PathBuf>,
    /// Local thumbnail path, relative to the store root
    pub thumb_path: Option<PathBuf>,
    /// Caption text; `None` until analyzed
    pub caption: Option<String>,
    /// Tags, merged from the source site and analysis
    pub tags: Vec<String>,
    /// Size of the original file in bytes
    pub size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Whether the vision pipeline has produced a caption for this image
    pub fn is_analyzed(&self) -> bool {
        self.caption.is_some()
    }
}

/// One hit returned by a search adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultItem {
    pub url: String,
    pub source: String,
    pub source_id: Option<String>,
    pub tags: Vec<String>,
    /// Alt text or description from the source site
    pub alt: String,
}

/// Output of a single inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    /// Natural-language caption text
    pub text: String,
    /// Detected object labels, empty when objects were not requested
    pub objects: Vec<String>,
}

/// Options for one inference call.
#[derive(Debug, Clone)]
pub struct CaptionOptions {
    /// Also detect object labels
    pub need_objects: bool,
    /// Wall-clock budget for the call
    pub timeout: Duration,
}

impl Default for CaptionOptions {
    fn default() -> Self {
        Self {
            need_objects: true,
            timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ImageRecord {
        ImageRecord {
            id: "img-1".to_string(),
            url: "https://example.com/a.jpg".to_string(),
            source: "Pixabay".to_string(),
            source_id: None,
            query: "mountain".to_string(),
            path: Some(PathBuf::from("originals/a.jpg")),
            thumb_path: None,
            caption: None,
            tags: vec!["mountain".to_string()],
            size_bytes: 1024,
            downloaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_is_analyzed() {
        let mut rec = record();
        assert!(!rec.is_analyzed());
        rec.caption = Some("a mountain at dusk".to_string());
        assert!(rec.is_analyzed());
    }

    #[test]
    fn test_record_serialization() {
        let rec = record();
        let json = serde_json::to_string(&rec).expect("serialize");
        let back: ImageRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.id, rec.id);
        assert_eq!(back.url, rec.url);
        assert_eq!(back.tags, rec.tags);
    }

    #[test]
    fn test_caption_options_default() {
        let opts = CaptionOptions::default();
        assert!(opts.need_objects);
        assert_eq!(opts.timeout, Duration::from_secs(60));
    }
}
