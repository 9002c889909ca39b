use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    Detected,
    Matched,
    Unmatched,
    Uploading,
    Done,
    Error,
}

impl WatchStatus {
    pub const ALL: [WatchStatus; 6] = [
        WatchStatus::Detected,
        WatchStatus::Matched,
        WatchStatus::Unmatched,
        WatchStatus::Uploading,
        WatchStatus::Done,
        WatchStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Detected => "detected",
            WatchStatus::Matched => "matched",
            WatchStatus::Unmatched => "unmatched",
            WatchStatus::Uploading => "uploading",
            WatchStatus::Done => "done",
            WatchStatus::Error => "error",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == input.trim())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    Exact,
    Fuzzy,
    Manual,
    Unmatched,
}

impl MatchConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchConfidence::Exact => "exact",
            MatchConfidence::Fuzzy => "fuzzy",
            MatchConfidence::Manual => "manual",
            MatchConfidence::Unmatched => "unmatched",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "exact" => Some(MatchConfidence::Exact),
            "fuzzy" => Some(MatchConfidence::Fuzzy),
            "manual" => Some(MatchConfidence::Manual),
            "unmatched" => Some(MatchConfidence::Unmatched),
            _ => None,
        }
    }
}

/// One row of the watch log: everything known about an observed product folder.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct WatchLogEntry {
    pub id: i64,
    pub folder_name: String,
    pub folder_path: String,
    pub preset_name: String,
    pub parsed_product_name: String,
    pub parsed_serial_suffix: Option<String>,
    pub shopify_product_id: Option<String>,
    pub shopify_title: Option<String>,
    pub match_confidence: Option<MatchConfidence>,
    pub image_count: i64,
    pub status: WatchStatus,
    pub error: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchStats {
    pub total: i64,
    pub detected: i64,
    pub matched: i64,
    pub unmatched: i64,
    pub uploading: i64,
    pub done: i64,
    pub error: i64,
    pub images_uploaded: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Error => "error",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl PipelineStep {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineJob {
    pub id: String,
    pub shopify_product_id: String,
    pub shopify_title: Option<String>,
    pub status: JobStatus,
    pub steps: Vec<PipelineStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl PipelineJob {
    /// Name of the step currently running, or the last step that moved.
    pub fn current_step(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Running)
            .or_else(|| {
                self.steps
                    .iter()
                    .rev()
                    .find(|step| step.status != StepStatus::Pending)
            })
            .map(|step| step.name.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
