use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

pub mod cluster;
pub mod collection;

pub use cluster::ClusterClient;
pub use collection::CollectionClient;

/// Body substrings that mark a 400/422 response as a malformed request.
pub const DEFAULT_SCHEMA_MARKERS: &[&str] = &[
    "Format error",
    "Validation error",
    "unknown field",
    "invalid type",
];

/// Errors from either control plane.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed request rejected by {url} ({status}): {body}")]
    Schema { url: String, status: u16, body: String },

    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl ApiError {
    /// Everything except a schema violation may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApiError::Schema { .. })
    }
}

/// Turn a non-success response into the matching [`ApiError`] class.
pub fn classify_failure(url: &str, status: u16, body: String, markers: &[String]) -> ApiError {
    let schema_status = status == 400 || status == 422;
    if schema_status && markers.iter().any(|m| body.contains(m.as_str())) {
        ApiError::Schema {
            url: url.to_string(),
            status,
            body,
        }
    } else {
        ApiError::Status {
            url: url.to_string(),
            status,
            body,
        }
    }
}

pub(crate) async fn send(
    url: &str,
    request: reqwest::RequestBuilder,
    markers: &[String],
) -> Result<reqwest::Response, ApiError> {
    let response = request.send().await.map_err(|source| ApiError::Transport {
        url: url.to_string(),
        source,
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(url, status.as_u16(), body, markers))
}

pub(crate) async fn read_json(url: &str, response: reqwest::Response) -> Result<Value, ApiError> {
    response.json::<Value>().await.map_err(|e| ApiError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn build_http(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .tcp_nodelay(true)
        .use_rustls_tls()
        .build()?;
    Ok(client)
}

/// Collection status as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Green,
    Yellow,
    Grey,
    Red,
    #[serde(other)]
    Unknown,
}

/// The parts of `GET /collections/{name}` the driver looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionInfo {
    pub status: CollectionStatus,
    #[serde(default)]
    pub points_count: Option<u64>,
    /// Effective config (`hnsw_config`, `optimizer_config`, ...).
    #[serde(default)]
    pub config: Value,
}

impl CollectionInfo {
    pub fn points(&self) -> u64 {
        self.points_count.unwrap_or(0)
    }
}

/// Database-side control plane (collection config).
#[async_trait]
pub trait CollectionApi: Send + Sync {
    async fn collection_info(&self) -> Result<CollectionInfo, ApiError>;

    async fn update_collection(&self, patch: &Value) -> Result<(), ApiError>;

    /// Whether the data port answers its readiness probe with success.
    async fn ready(&self) -> bool;
}

/// Cluster-lifecycle control plane.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn descriptor(&self) -> Result<Value, ApiError>;

    async fn replace_descriptor(&self, descriptor: &Value) -> Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        DEFAULT_SCHEMA_MARKERS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_schema_errors_are_not_retryable() {
        let err = classify_failure(
            "http://db/collections/c",
            400,
            r#"{"status":{"error":"Format error in JSON body: unknown field `max_threads`"}}"#.into(),
            &markers(),
        );
        assert!(matches!(err, ApiError::Schema { status: 400, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_other_client_errors_are_retryable() {
        let err = classify_failure("http://db", 400, "Collection is being updated".into(), &markers());
        assert!(matches!(err, ApiError::Status { status: 400, .. }));
        assert!(err.is_retryable());

        let err = classify_failure("http://db", 500, "Validation error".into(), &markers());
        assert!(err.is_retryable(), "a marker on a 5xx is still transient");
    }

    #[test]
    fn test_collection_info_decodes() {
        let info: CollectionInfo = serde_json::from_value(serde_json::json!({
            "status": "yellow",
            "optimizer_status": "ok",
            "points_count": 1200,
            "config": {"hnsw_config": {"m": 16}}
        }))
        .unwrap();
        assert_eq!(info.status, CollectionStatus::Yellow);
        assert_eq!(info.points(), 1200);
        assert_eq!(info.config["hnsw_config"]["m"], 16);

        let info: CollectionInfo =
            serde_json::from_value(serde_json::json!({"status": "rebuilding"})).unwrap();
        assert_eq!(info.status, CollectionStatus::Unknown);
        assert_eq!(info.points(), 0);
    }
}
