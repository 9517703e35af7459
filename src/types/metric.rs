use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

/// A single measurement. `labels` uses a `BTreeMap` so label sets compare and
/// hash deterministically when canonicalized to a timeseries bucket key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Canonical JSON form of a label set, used as part of timeseries bucket keys
/// so two equal label maps always produce the same string.
pub fn canonicalize_labels(labels: &BTreeMap<String, String>) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "{}".to_string())
}
