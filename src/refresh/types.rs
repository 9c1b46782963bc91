use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

pub const REFRESH_TYPE_FULL: &str = "Full";
pub const COMMIT_MODE_TRANSACTIONAL: &str = "transactional";
pub const DEFAULT_MAX_PARALLELISM: u32 = 2;
pub const DEFAULT_RETRY_COUNT: u32 = 2;
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Workspace and dataset a refresh is aimed at
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatasetTarget {
    pub workspace_id: String,
    pub dataset_id: String,
}

impl DatasetTarget {
    pub fn new(workspace_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            dataset_id: dataset_id.into(),
        }
    }
}

/// A table, optionally narrowed to one partition, to include in a refresh
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshObjectRef {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

impl RefreshObjectRef {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            partition: None,
        }
    }

    pub fn partition(table: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            partition: Some(partition.into()),
        }
    }

    /// Parse a JSON list such as `[{"table": "DimDate"}, {"table": "Sales", "partition": "2024"}]`
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if !value.is_array() {
            return Err(Error::Validation(
                "refresh_objects must be a JSON list of objects".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Body of the enhanced refresh call. The target is carried alongside for
/// URL construction and is not part of the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(skip)]
    pub target: DatasetTarget,
    #[serde(rename = "type")]
    pub refresh_type: String,
    pub commit_mode: String,
    pub max_parallelism: u32,
    pub retry_count: u32,
    #[serde(serialize_with = "serialize_timespan")]
    pub timeout: Duration,
    pub objects: Vec<RefreshObjectRef>,
}

impl RefreshRequest {
    /// Full transactional refresh of `objects` with the standard policy
    pub fn full(target: DatasetTarget, objects: Vec<RefreshObjectRef>) -> Self {
        Self {
            target,
            refresh_type: REFRESH_TYPE_FULL.to_string(),
            commit_mode: COMMIT_MODE_TRANSACTIONAL.to_string(),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            retry_count: DEFAULT_RETRY_COUNT,
            timeout: DEFAULT_REFRESH_TIMEOUT,
            objects,
        }
    }
}

/// Renders a duration as `hh:mm:ss`
fn serialize_timespan<S: Serializer>(
    timeout: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let secs = timeout.as_secs();
    serializer.serialize_str(&format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    ))
}

/// Refresh status as reported by the service.
///
/// Only `Unknown` and `InProgress` are treated specially; any other value is
/// terminal and kept verbatim so new service states pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RefreshStatus(String);

impl RefreshStatus {
    pub const UNKNOWN: &'static str = "Unknown";
    pub const IN_PROGRESS: &'static str = "InProgress";
    pub const COMPLETED: &'static str = "Completed";

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_terminal(&self) -> bool {
        !(self.0.eq_ignore_ascii_case(Self::UNKNOWN)
            || self.0.eq_ignore_ascii_case(Self::IN_PROGRESS))
    }

    pub fn is_completed(&self) -> bool {
        self.0.eq_ignore_ascii_case(Self::COMPLETED)
    }
}

impl Default for RefreshStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a dataset's refresh history
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRecord {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub refresh_type: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub status: RefreshStatus,
    #[serde(default)]
    pub service_exception_json: Option<String>,
}

/// `GET .../refreshes` response, most recent first
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshHistory {
    #[serde(default)]
    pub value: Vec<RefreshRecord>,
}

impl RefreshHistory {
    pub fn latest(self) -> Option<RefreshRecord> {
        self.value.into_iter().next()
    }
}

/// Terminal result of a polled refresh
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub status: RefreshStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub request_id: Option<String>,
    pub service_exception_json: Option<String>,
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_completed()
    }
}
