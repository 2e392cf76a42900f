//! Tuning records and their wire representation.
//!
//! A [`TuningRecord`] carries the seven knobs applied before a grid cell runs.
//! Five of them live on the collection (optimizer and HNSW config), two on the
//! cluster descriptor (storage performance). Knobs that the server may choose
//! on its own are modelled as [`Knob::Auto`]; each field documents how "auto"
//! travels on the wire and how it reads back.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// A knob value that may be left to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Knob<T> {
    Auto,
    Value(T),
}

impl<T> Knob<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Knob::Auto => None,
            Knob::Value(v) => Some(v),
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Knob::Auto)
    }
}

impl<T: fmt::Display> fmt::Display for Knob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Knob::Auto => f.write_str("auto"),
            Knob::Value(v) => write!(f, "{v}"),
        }
    }
}

impl<T: FromStr> FromStr for Knob<T>
where
    T::Err: fmt::Display,
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Knob::Auto);
        }
        s.parse::<T>()
            .map(Knob::Value)
            .map_err(|e| format!("expected a number or \"auto\", got \"{s}\": {e}"))
    }
}

impl<T: Serialize> Serialize for Knob<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Knob::Auto => serializer.serialize_str("auto"),
            Knob::Value(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T> Deserialize<'de> for Knob<T>
where
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Environment overrides arrive as strings, so "4" must parse as well as 4.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<U> {
            Value(U),
            Text(String),
        }

        match Repr::<T>::deserialize(deserializer)? {
            Repr::Value(v) => Ok(Knob::Value(v)),
            Repr::Text(s) => s.parse().map_err(D::Error::custom),
        }
    }
}

/// Which remote API owns a knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPlane {
    Collection,
    Cluster,
}

impl fmt::Display for ControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlPlane::Collection => f.write_str("collection"),
            ControlPlane::Cluster => f.write_str("cluster"),
        }
    }
}

/// The knobs applied before a grid cell's benchmark runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TuningRecord {
    /// `optimizers_config.max_optimization_threads`; auto is sent as `"auto"`
    /// and reads back as `null`.
    pub optimizer_threads: Knob<u32>,
    /// `hnsw_config.max_indexing_threads`; auto is `0`.
    pub indexing_threads: Knob<u32>,
    /// `optimizers_config.default_segment_number`; auto is `0`.
    pub segment_number: Knob<u32>,
    /// `optimizers_config.max_segment_size` in KB; auto is `null`.
    pub max_segment_size_kb: Knob<u64>,
    /// `optimizers_config.indexing_threshold` in KB.
    pub indexing_threshold_kb: u64,
    /// Cluster `optimizer_cpu_budget`; auto is `0`.
    pub cpu_budget: Knob<i64>,
    /// Cluster `async_scorer`.
    pub async_scorer: bool,
}

impl Default for TuningRecord {
    fn default() -> Self {
        Self {
            optimizer_threads: Knob::Auto,
            indexing_threads: Knob::Auto,
            segment_number: Knob::Auto,
            max_segment_size_kb: Knob::Auto,
            indexing_threshold_kb: 20_000,
            cpu_budget: Knob::Auto,
            async_scorer: false,
        }
    }
}

/// One field the remote side must report after an apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub field: &'static str,
    pub plane: ControlPlane,
    /// JSON pointer into the effective collection config or the cluster
    /// performance object.
    pub pointer: &'static str,
    pub expected: Value,
}

/// A field whose read-back value differs from what was submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMismatch {
    pub field: &'static str,
    pub plane: ControlPlane,
    pub expected: Value,
    pub observed: Value,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): expected {}, observed {}",
            self.field, self.plane, self.expected, self.observed
        )
    }
}

fn count_or_zero<T: Copy + Into<u64>>(knob: &Knob<T>) -> u64 {
    knob.value().map(|v| (*v).into()).unwrap_or(0)
}

impl TuningRecord {
    /// Body for `PATCH /collections/{name}`.
    pub fn collection_patch(&self) -> Value {
        let optimizer_threads = match self.optimizer_threads {
            Knob::Auto => json!("auto"),
            Knob::Value(n) => json!(n),
        };
        json!({
            "optimizers_config": {
                "max_optimization_threads": optimizer_threads,
                "default_segment_number": count_or_zero(&self.segment_number),
                "max_segment_size": self.max_segment_size_kb.value(),
                "indexing_threshold": self.indexing_threshold_kb,
            },
            "hnsw_config": {
                "max_indexing_threads": count_or_zero(&self.indexing_threads),
            }
        })
    }

    /// Storage performance object written into the cluster descriptor.
    pub fn cluster_performance(&self) -> Value {
        json!({
            "optimizer_cpu_budget": self.cpu_budget.value().copied().unwrap_or(0),
            "async_scorer": self.async_scorer,
        })
    }

    /// What each control plane should report once this record is in effect.
    pub fn expectations(&self) -> Vec<Expectation> {
        vec![
            Expectation {
                field: "optimizer_threads",
                plane: ControlPlane::Collection,
                pointer: "/optimizer_config/max_optimization_threads",
                expected: json!(self.optimizer_threads.value()),
            },
            Expectation {
                field: "indexing_threads",
                plane: ControlPlane::Collection,
                pointer: "/hnsw_config/max_indexing_threads",
                expected: json!(count_or_zero(&self.indexing_threads)),
            },
            Expectation {
                field: "segment_number",
                plane: ControlPlane::Collection,
                pointer: "/optimizer_config/default_segment_number",
                expected: json!(count_or_zero(&self.segment_number)),
            },
            Expectation {
                field: "max_segment_size_kb",
                plane: ControlPlane::Collection,
                pointer: "/optimizer_config/max_segment_size",
                expected: json!(self.max_segment_size_kb.value()),
            },
            Expectation {
                field: "indexing_threshold_kb",
                plane: ControlPlane::Collection,
                pointer: "/optimizer_config/indexing_threshold",
                expected: json!(self.indexing_threshold_kb),
            },
            Expectation {
                field: "cpu_budget",
                plane: ControlPlane::Cluster,
                pointer: "/optimizer_cpu_budget",
                expected: json!(self.cpu_budget.value().copied().unwrap_or(0)),
            },
            Expectation {
                field: "async_scorer",
                plane: ControlPlane::Cluster,
                pointer: "/async_scorer",
                expected: json!(self.async_scorer),
            },
        ]
    }

    /// Compare against the effective collection config (`result.config`) and
    /// the cluster's storage performance object. Missing fields read as null.
    pub fn verify(&self, collection_config: &Value, cluster_performance: &Value) -> Vec<FieldMismatch> {
        self.expectations()
            .into_iter()
            .filter_map(|exp| {
                let source = match exp.plane {
                    ControlPlane::Collection => collection_config,
                    ControlPlane::Cluster => cluster_performance,
                };
                let observed = source.pointer(exp.pointer).cloned().unwrap_or(Value::Null);
                if values_match(&exp.expected, &observed) {
                    None
                } else {
                    Some(FieldMismatch {
                        field: exp.field,
                        plane: exp.plane,
                        expected: exp.expected,
                        observed,
                    })
                }
            })
            .collect()
    }

    /// Stable, filesystem-safe identifier for this record.
    pub fn key(&self) -> String {
        format!(
            "ot{}-it{}-sn{}-ss{}-th{}-cpu{}-as{}",
            self.optimizer_threads,
            self.indexing_threads,
            self.segment_number,
            self.max_segment_size_kb,
            self.indexing_threshold_kb,
            self.cpu_budget,
            u8::from(self.async_scorer)
        )
    }
}

impl fmt::Display for TuningRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "optimizer_threads={} indexing_threads={} segment_number={} max_segment_size_kb={} indexing_threshold_kb={} cpu_budget={} async_scorer={}",
            self.optimizer_threads,
            self.indexing_threads,
            self.segment_number,
            self.max_segment_size_kb,
            self.indexing_threshold_kb,
            self.cpu_budget,
            self.async_scorer
        )
    }
}

/// Numbers compare by value so `2` and `2.0` agree.
fn values_match(expected: &Value, observed: &Value) -> bool {
    match (expected, observed) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => expected == observed,
    }
}
