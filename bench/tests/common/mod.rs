//! In-process fake of the database REST API and the cluster-lifecycle API.

#![allow(dead_code)]

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use sweep_bench::config::LaunchMode;
use sweep_bench::SweepConfig;

pub const ACCOUNT: &str = "acct-1";
pub const CLUSTER: &str = "cluster-1";
pub const DB_KEY: &str = "db-secret";
pub const CLUSTER_KEY: &str = "cluster-secret";

pub struct FakeState {
    pub collection_config: Value,
    pub created: Option<Value>,
    pub status: &'static str,
    pub points: u64,
    pub deleted: Vec<u64>,
    pub ready: bool,
    /// Returned (status, body) for the next PATCH calls, in order
    pub patch_failures: VecDeque<(u16, String)>,
    pub patch_calls: u32,
    pub descriptor: Value,
    /// Consumed one per descriptor GET
    pub phases: VecDeque<&'static str>,
    /// Server overrides the submitted CPU budget with this value
    pub pinned_cpu_budget: Option<i64>,
    pub cluster_puts: u32,
    /// Returned (status, body) for the next descriptor PUT calls, in order
    pub put_failures: VecDeque<(u16, String)>,
    pub sys_metrics_status: u16,
    pub db_keys_seen: Vec<String>,
    pub cluster_auth_seen: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            collection_config: json!({
                "params": {"vectors": {"size": 768, "distance": "Cosine"}},
                "hnsw_config": {"m": 16, "ef_construct": 100, "max_indexing_threads": 0},
                "optimizer_config": {
                    "max_optimization_threads": null,
                    "default_segment_number": 0,
                    "max_segment_size": null,
                    "indexing_threshold": 20000
                }
            }),
            created: None,
            status: "green",
            points: 0,
            deleted: Vec::new(),
            ready: true,
            patch_failures: VecDeque::new(),
            patch_calls: 0,
            descriptor: json!({
                "id": CLUSTER,
                "name": "bench",
                "state": {"phase": "Healthy"},
                "configuration": {
                    "number_of_nodes": 3,
                    "database_configuration": {
                        "service": {"jwt_rbac": false},
                        "storage": {"performance": {"optimizer_cpu_budget": 0, "async_scorer": false}}
                    }
                }
            }),
            phases: VecDeque::new(),
            pinned_cpu_budget: None,
            cluster_puts: 0,
            put_failures: VecDeque::new(),
            sys_metrics_status: 200,
            db_keys_seen: Vec::new(),
            cluster_auth_seen: Vec::new(),
        }
    }
}

pub type Shared = Arc<Mutex<FakeState>>;

pub struct FakeServer {
    pub addr: SocketAddr,
    pub state: Shared,
}

impl FakeServer {
    pub async fn start() -> Self {
        Self::start_with(FakeState::default()).await
    }

    pub async fn start_with(state: FakeState) -> Self {
        let state: Shared = Arc::new(Mutex::new(state));
        let app = Router::new()
            .route(
                "/collections/:name",
                get(get_collection)
                    .patch(patch_collection)
                    .put(put_collection)
                    .delete(delete_collection),
            )
            .route("/collections/:name/points/delete", post(delete_points))
            .route("/readyz", get(readyz))
            .route("/metrics", get(metrics))
            .route("/sys_metrics", get(sys_metrics))
            .route("/telemetry", get(telemetry))
            .route(
                "/api/accounts/:account/clusters/:cluster",
                get(get_cluster).put(put_cluster),
            )
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Configuration pointing both control planes at this fake, with fast polling.
    pub fn config(&self, output_dir: &FsPath) -> SweepConfig {
        let mut config = SweepConfig::default();
        config.database.url = self.url();
        config.database.api_key = Some(DB_KEY.to_string());
        config.database.collection = "bench".to_string();
        config.cluster.url = format!("{}/api", self.url());
        config.cluster.account_id = ACCOUNT.to_string();
        config.cluster.cluster_id = CLUSTER.to_string();
        config.cluster.api_key = Some(CLUSTER_KEY.to_string());
        config.polling.health_interval_ms = 10;
        config.polling.green_interval_ms = 10;
        config.polling.retry_delay_ms = 10;
        config.polling.health_timeout_secs = Some(5);
        config.polling.green_timeout_secs = Some(5);
        config.benchmark.launch = LaunchMode::Direct;
        config.loader.program = "/bin/sh".to_string();
        config.loader.args = vec!["-c".to_string(), "echo loading $LIMIT_POINTS".to_string()];
        config.loader.baseline_rows = 100;
        config.loader.stop_grace_secs = 2;
        config.output.dir = output_dir.to_path_buf();
        config.output.progress = false;
        config
    }
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn get_collection(
    State(state): State<Shared>,
    Path(_name): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    s.db_keys_seen.push(header(&headers, "api-key"));
    Json(json!({
        "result": {
            "status": s.status,
            "optimizer_status": "ok",
            "points_count": s.points,
            "config": s.collection_config,
        },
        "status": "ok",
        "time": 0.001
    }))
}

async fn patch_collection(
    State(state): State<Shared>,
    Path(_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    s.patch_calls += 1;
    s.db_keys_seen.push(header(&headers, "api-key"));
    if let Some((status, message)) = s.patch_failures.pop_front() {
        let code = StatusCode::from_u16(status).unwrap();
        return (code, Json(json!({"status": {"error": message}})));
    }

    if let Some(optimizers) = body["optimizers_config"].as_object() {
        for (key, value) in optimizers {
            // Null in a diff means "leave unchanged"; "auto" is resolved by
            // the server and reported back as null.
            let value = match value {
                Value::Null => continue,
                v if v == "auto" => Value::Null,
                v => v.clone(),
            };
            s.collection_config["optimizer_config"][key] = value;
        }
    }
    if let Some(hnsw) = body["hnsw_config"].as_object() {
        for (key, value) in hnsw.iter().filter(|(_, v)| !v.is_null()) {
            s.collection_config["hnsw_config"][key] = value.clone();
        }
    }
    (StatusCode::OK, Json(json!({"result": true, "status": "ok"})))
}

async fn put_collection(
    State(state): State<Shared>,
    Path(_name): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    s.created = Some(body);
    s.points = 0;
    Json(json!({"result": true, "status": "ok"}))
}

async fn delete_collection(State(state): State<Shared>, Path(_name): Path<String>) -> impl IntoResponse {
    state.lock().unwrap().created = None;
    Json(json!({"result": true, "status": "ok"}))
}

async fn delete_points(
    State(state): State<Shared>,
    Path(_name): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    let ids: Vec<u64> = body["points"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default();
    s.points = s.points.saturating_sub(ids.len() as u64);
    s.deleted.extend(ids);
    Json(json!({"result": {"status": "completed"}, "status": "ok"}))
}

async fn readyz(State(state): State<Shared>) -> impl IntoResponse {
    if state.lock().unwrap().ready {
        (StatusCode::OK, "all shards are ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "some shards are not ready")
    }
}

async fn metrics() -> impl IntoResponse {
    "# HELP app_info information about qdrant server\ncollections_total 1\n"
}

async fn sys_metrics(State(state): State<Shared>) -> impl IntoResponse {
    let status = StatusCode::from_u16(state.lock().unwrap().sys_metrics_status).unwrap();
    (status, "cpu_usage 0.5\n")
}

async fn telemetry() -> impl IntoResponse {
    Json(json!({"result": {"collections": {"number_of_collections": 1}}, "status": "ok"}))
}

async fn get_cluster(
    State(state): State<Shared>,
    Path((_account, _cluster)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    s.cluster_auth_seen.push(header(&headers, "authorization"));
    if let Some(phase) = s.phases.pop_front() {
        s.descriptor["state"]["phase"] = json!(phase);
    }
    Json(s.descriptor.clone())
}

async fn put_cluster(
    State(state): State<Shared>,
    Path((_account, _cluster)): Path<(String, String)>,
    Json(mut body): Json<Value>,
) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    s.cluster_puts += 1;
    if let Some((status, message)) = s.put_failures.pop_front() {
        let code = StatusCode::from_u16(status).unwrap();
        return (code, Json(json!({"error": message})));
    }
    if let Some(budget) = s.pinned_cpu_budget {
        body["configuration"]["database_configuration"]["storage"]["performance"]
            ["optimizer_cpu_budget"] = json!(budget);
    }
    s.descriptor = body.clone();
    (StatusCode::OK, Json(body))
}

/// Write an executable shell script and return its path.
#[cfg(unix)]
pub fn script(dir: &FsPath, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A stand-in load generator. `--parallel 2` exits non-zero, `--parallel 3`
/// exits cleanly without writing a result file, anything else succeeds.
#[cfg(unix)]
pub fn fake_load_generator(dir: &FsPath) -> std::path::PathBuf {
    script(
        dir,
        "fake-bfb.sh",
        r#"out=""
parallel=""
while [ $# -gt 0 ]; do
  case "$1" in
    --json) out="$2"; shift 2 ;;
    --parallel) parallel="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "args parsed: parallel=$parallel out=$out"
if [ "$parallel" = "2" ]; then echo "connection refused" >&2; exit 1; fi
if [ "$parallel" = "3" ]; then exit 0; fi
printf '{"rps": [100.0, 200.0], "latencies": [0.001, 0.002, 0.003]}' > "$out""#,
    )
}
