//! Pexels search adapter

use serde_json::Value;

use super::{status_error, SourceError};
use crate::types::image::ResultItem;

const ENDPOINT: &str = "https://api.pexels.com/v1/search";
const PER_PAGE: u32 = 80;

pub(crate) async fn search(
    client: &reqwest::Client,
    key: &str,
    query: &str,
    page: u32,
) -> Result<Vec<ResultItem>, SourceError> {
    if key.is_empty() {
        return Err(SourceError::MissingKey("pexels".to_string()));
    }

    let response = client
        .get(ENDPOINT)
        .header("Authorization", key)
        .query(&[
            ("query", query),
            ("per_page", &PER_PAGE.to_string()),
            ("page", &page.to_string()),
        ])
        .send()
        .await
        .map_err(|e| SourceError::Http(e.to_string()))?;

    if !response.status().is_success() {
        return Err(status_error("pexels", response.status()));
    }

    let payload: Value = response.json().await.map_err(|e| SourceError::BadPayload {
        site: "pexels".to_string(),
        reason: e.to_string(),
    })?;

    Ok(map_response(query, &payload))
}

fn map_response(query: &str, payload: &Value) -> Vec<ResultItem> {
    let photos = match payload["photos"].as_array() {
        Some(photos) => photos,
        None => return Vec::new(),
    };

    photos
        .iter()
        .filter_map(|photo| {
            let url = photo["src"]["large2x"].as_str()?;
            Some(ResultItem {
                url: url.to_string(),
                source: "Pexels".to_string(),
                source_id: photo["id"].as_u64().map(|id| id.to_string()),
                // Pexels carries no tag list; seed with the query.
                tags: vec![query.trim().to_string()],
                alt: photo["alt"].as_str().unwrap_or("").to_string(),
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
            "photos": [
                {
                    "id": 99,
                    "alt": "a mountain trail",
                    "src": { "large2x": "https://images.pexels.com/99/large2x.jpg" }
                },
                {
                    "id": 100,
                    "src": {}
                }
            ]
        });

        let items = map_response("mountain", &payload);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://images.pexels.com/99/large2x.jpg");
        assert_eq!(items[0].alt, "a mountain trail");
        assert_eq!(items[0].tags, vec!["mountain"]);
        assert_eq!(items[0].source_id.as_deref(), Some("99"));
    }
}
