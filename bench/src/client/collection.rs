use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{build_http, read_json, send, ApiError, CollectionApi, CollectionInfo};
use crate::config::{DatabaseConfig, PrepareConfig};

/// REST client for one collection on the database endpoint.
#[derive(Clone)]
pub struct CollectionClient {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    readiness_path: String,
    schema_markers: Vec<String>,
}

impl CollectionClient {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self {
            http: build_http(Duration::from_secs(config.request_timeout_secs))?,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key: config.api_key.clone(),
            readiness_path: config.readiness_path.clone(),
            schema_markers: config.schema_error_markers.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    /// Create the collection. With `recreate` an existing one is dropped first.
    pub async fn create_collection(&self, prepare: &PrepareConfig, recreate: bool) -> Result<(), ApiError> {
        let url = self.collection_url();
        if recreate {
            let response = self.request(reqwest::Method::DELETE, &url).send().await;
            match response {
                Ok(r) => debug!(status = r.status().as_u16(), "dropped collection"),
                Err(source) => return Err(ApiError::Transport { url, source }),
            }
        }

        let body = json!({
            "vectors": {
                "size": prepare.vector_size,
                "distance": prepare.distance,
                "on_disk": prepare.on_disk,
                "datatype": prepare.datatype,
            },
            "optimizers_config": {
                "indexing_threshold": prepare.indexing_threshold_kb,
            }
        });
        send(
            &url,
            self.request(reqwest::Method::PUT, &url).json(&body),
            &self.schema_markers,
        )
        .await?;
        Ok(())
    }

    /// Delete points by id, waiting for the operation to be applied.
    pub async fn delete_points(&self, ids: &[u64]) -> Result<(), ApiError> {
        let url = format!("{}/points/delete?wait=true", self.collection_url());
        send(
            &url,
            self.request(reqwest::Method::POST, &url)
                .json(&json!({ "points": ids })),
            &self.schema_markers,
        )
        .await?;
        Ok(())
    }

    /// Fetch an arbitrary path (metrics, telemetry) as raw text.
    pub async fn fetch_text(&self, path: &str) -> Result<String, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = send(
            &url,
            self.request(reqwest::Method::GET, &url),
            &self.schema_markers,
        )
        .await?;
        response.text().await.map_err(|source| ApiError::Transport { url, source })
    }
}

#[async_trait]
impl CollectionApi for CollectionClient {
    async fn collection_info(&self) -> Result<CollectionInfo, ApiError> {
        let url = self.collection_url();
        let response = send(
            &url,
            self.request(reqwest::Method::GET, &url),
            &self.schema_markers,
        )
        .await?;
        let mut body = read_json(&url, response).await?;
        let result = body
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| ApiError::Decode {
                url: url.clone(),
                reason: "missing `result`".to_string(),
            })?;
        serde_json::from_value(result).map_err(|e| ApiError::Decode {
            url,
            reason: e.to_string(),
        })
    }

    async fn update_collection(&self, patch: &Value) -> Result<(), ApiError> {
        let url = self.collection_url();
        send(
            &url,
            self.request(reqwest::Method::PATCH, &url).json(patch),
            &self.schema_markers,
        )
        .await?;
        Ok(())
    }

    async fn ready(&self) -> bool {
        let url = format!("{}{}", self.base_url, self.readiness_path);
        match self.request(reqwest::Method::GET, &url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "readiness probe failed");
                false
            }
        }
    }
}
