//! Job lifecycle state and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Job lifecycle: `Queued → Running → {Succeeded, Failed, Cancelled}`.
/// Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// One event on a job's progress stream.
///
/// `seq` and `percent` are monotonically non-decreasing per job; the last
/// event of a stream has `terminal = true` and carries the final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub seq: u64,
    pub percent: u8,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substep: Option<String>,
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
}

/// Snapshot returned by the status endpoint and `Orchestrator::get`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: Uuid,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<ProgressEvent>,
    /// Set once the job succeeded and its report was persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<Uuid>,
    /// Failure reason for failed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn progress_event_json_shape() {
        let event = ProgressEvent {
            seq: 3,
            percent: 40,
            status: "warehouse-execute".into(),
            substep: Some("rows: 1000".into()),
            terminal: false,
            state: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["seq"], 3);
        assert_eq!(value["percent"], 40);
        assert_eq!(value["terminal"], false);
        assert!(value.get("state").is_none());
    }
}
