use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

use super::{build_http, read_json, send, ApiError, ClusterApi};
use crate::config::ClusterConfig;

/// Location of the cluster phase inside the descriptor.
pub const PHASE_POINTER: &str = "/state/phase";

/// Location of the storage performance knobs inside the descriptor.
pub const PERFORMANCE_PATH: &[&str] = &[
    "configuration",
    "database_configuration",
    "storage",
    "performance",
];

/// Client for the cluster-lifecycle API.
#[derive(Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    cluster_url: String,
    api_key: Option<String>,
    schema_markers: Vec<String>,
}

impl ClusterClient {
    pub fn new(config: &ClusterConfig, schema_markers: Vec<String>) -> Result<Self> {
        Ok(Self {
            http: build_http(Duration::from_secs(config.request_timeout_secs))?,
            cluster_url: format!(
                "{}/accounts/{}/clusters/{}",
                config.url.trim_end_matches('/'),
                config.account_id,
                config.cluster_id
            ),
            api_key: config.api_key.clone(),
            schema_markers,
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, &self.cluster_url);
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("apikey {key}")),
            None => builder,
        }
    }
}

#[async_trait]
impl ClusterApi for ClusterClient {
    async fn descriptor(&self) -> Result<Value, ApiError> {
        let response = send(
            &self.cluster_url,
            self.request(reqwest::Method::GET),
            &self.schema_markers,
        )
        .await?;
        read_json(&self.cluster_url, response).await
    }

    async fn replace_descriptor(&self, descriptor: &Value) -> Result<(), ApiError> {
        send(
            &self.cluster_url,
            self.request(reqwest::Method::PUT).json(descriptor),
            &self.schema_markers,
        )
        .await?;
        Ok(())
    }
}

/// Current rollout phase, if the descriptor reports one.
pub fn phase(descriptor: &Value) -> Option<&str> {
    descriptor.pointer(PHASE_POINTER).and_then(Value::as_str)
}

/// Storage performance object, `Null` when absent.
pub fn performance(descriptor: &Value) -> Value {
    let pointer = format!("/{}", PERFORMANCE_PATH.join("/"));
    descriptor.pointer(&pointer).cloned().unwrap_or(Value::Null)
}

/// Merge `knobs` into the descriptor's performance object, creating the
/// intermediate objects as needed. Other fields are left untouched.
pub fn merge_performance(descriptor: &mut Value, knobs: &Value) {
    let mut node = descriptor;
    for segment in PERFORMANCE_PATH {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(obj) = node else {
            return;
        };
        node = obj.entry(segment.to_string()).or_insert(Value::Null);
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let (Some(target), Some(source)) = (node.as_object_mut(), knobs.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
}
