//! Pixabay search adapter

use serde_json::Value;

use super::{status_error, SourceError};
use crate::types::image::ResultItem;

const ENDPOINT: &str = "https://pixabay.com/api/";
const PER_PAGE: u32 = 200;

pub(crate) async fn search(
    client: &reqwest::Client,
    key: &str,
    query: &str,
    page: u32,
) -> Result<Vec<ResultItem>, SourceError> {
    if key.is_empty() {
        return Err(SourceError::MissingKey("pixabay".to_string()));
    }

    let response = client
        .get(ENDPOINT)
        .query(&[
            ("key", key),
            ("q", query),
            ("per_page", &PER_PAGE.to_string()),
            ("page", &page.to_string()),
            ("image_type", "photo"),
            ("safesearch", "true"),
        ])
        .send()
        .await
        .map_err(|e| SourceError::Http(e.to_string()))?;

    if !response.status().is_success() {
        return Err(status_error("pixabay", response.status()));
    }

    let payload: Value = response.json().await.map_err(|e| SourceError::BadPayload {
        site: "pixabay".to_string(),
        reason: e.to_string(),
    })?;

    Ok(map_response(&payload))
}

fn map_response(payload: &Value) -> Vec<ResultItem> {
    let hits = match payload["hits"].as_array() {
        Some(hits) => hits,
        None => return Vec::new(),
    };

    hits.iter()
        .filter_map(|hit| {
            let url = hit["largeImageURL"].as_str()?;
            let tags = hit["tags"]
                .as_str()
                .unwrap_or("")
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();

            Some(ResultItem {
                url: url.to_string(),
                source: "Pixabay".to_string(),
                source_id: hit["id"].as_u64().map(|id| id.to_string()),
                tags,
                alt: String::new(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_response() {
        let payload = json!({
            "hits": [
                {
                    "id": 12345,
                    "largeImageURL": "https://pixabay.com/large/a.jpg",
                    "tags": "mountain, snow , lake"
                },
                {
                    // No URL: dropped.
                    "id": 6,
                    "tags": "x"
                }
            ]
        });

        let items = map_response(&payload);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://pixabay.com/large/a.jpg");
        assert_eq!(items[0].source, "Pixabay");
        assert_eq!(items[0].source_id.as_deref(), Some("12345"));
        assert_eq!(items[0].tags, vec!["mountain", "snow", "lake"]);
    }

    #[test]
    fn test_map_response_empty_payload() {
        assert!(map_response(&json!({})).is_empty());
        assert!(map_response(&json!({"hits": []})).is_empty());
    }
}
