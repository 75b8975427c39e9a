//! Unsplash search adapter

use serde_json::Value;

use super::{status_error, SourceError};
use crate::types::image::ResultItem;

const ENDPOINT: &str = "https://api.unsplash.com/search/photos";
const PER_PAGE: u32 = 30;

pub(crate) async fn search(
    client: &reqwest::Client,
    key: &str,
    query: &str,
    page: u32,
) -> Result<Vec<ResultItem>, SourceError> {
    if key.is_empty() {
        return Err(SourceError::MissingKey("unsplash".to_string()));
    }

    let response = client
        .get(ENDPOINT)
        .header("Authorization", format!("Client-ID {}", key))
        .query(&[
            ("query", query),
            ("per_page", &PER_PAGE.to_string()),
            ("page", &page.to_string()),
        ])
        .send()
        .await
        .map_err(|e| SourceError::Http(e.to_string()))?;

    if !response.status().is_success() {
        return Err(status_error("unsplash", response.status()));
    }

    let payload: Value = response.json().await.map_err(|e| SourceError::BadPayload {
        site: "unsplash".to_string(),
        reason: e.to_string(),
    })?;

    Ok(map_response(&payload))
}

fn map_response(payload: &Value) -> Vec<ResultItem> {
    let results = match payload["results"].as_array() {
        Some(results) => results,
        None => return Vec::new(),
    };

    results
        .iter()
        .filter_map(|photo| {
            let url = photo["urls"]["full"].as_str()?;
            let alt = photo["alt_description"]
                .as_str()
                .or_else(|| photo["description"].as_str())
                .unwrap_or("")
                .to_string();
            let tags = photo["tags"]
                .as_array()
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t["title"].as_str())
                        .map(|t| t.to_string())
                        .collect()
                })
                .unwrap_or_default();

            Some(ResultItem {
                url: url.to_string(),
                source: "Unsplash".to_string(),
                source_id: photo["id"].as_str().map(|id| id.to_string()),
                tags,
                alt,
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
            "results": [
                {
                    "id": "abc123",
                    "alt_description": "aerial photo of a fjord",
                    "urls": { "full": "https://images.unsplash.com/abc123" },
                    "tags": [ { "title": "fjord" }, { "title": "norway" }, {} ]
                },
                {
                    "id": "no-url",
                    "urls": {}
                }
            ]
        });

        let items = map_response(&payload);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://images.unsplash.com/abc123");
        assert_eq!(items[0].alt, "aerial photo of a fjord");
        assert_eq!(items[0].tags, vec!["fjord", "norway"]);
        assert_eq!(items[0].source_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_description_fallback() {
        let payload = json!({
            "results": [
                {
                    "id": "x",
                    "alt_description": null,
                    "description": "long-form description",
                    "urls": { "full": "https://u/x" }
                }
            ]
        });
        let items = map_response(&payload);
        assert_eq!(items[0].alt, "long-form description");
    }
}
