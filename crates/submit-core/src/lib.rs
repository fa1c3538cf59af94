use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

pub mod metadata;

pub use metadata::{Category, ModelMetadata};

/// Opaque task identifier assigned by the store on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Pipeline position of a task.
///
/// Declaration order is the forward order of the pipeline; `Error` sits
/// outside the sequence and is reachable from every non-terminal status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Downloading,
    Extracting,
    Preparing,
    Analyzing,
    Uploading,
    FillingForm,
    Publishing,
    Done,
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::Created,
        TaskStatus::Downloading,
        TaskStatus::Extracting,
        TaskStatus::Preparing,
        TaskStatus::Analyzing,
        TaskStatus::Uploading,
        TaskStatus::FillingForm,
        TaskStatus::Publishing,
        TaskStatus::Done,
        TaskStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Extracting => "extracting",
            TaskStatus::Preparing => "preparing",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Uploading => "uploading",
            TaskStatus::FillingForm => "filling_form",
            TaskStatus::Publishing => "publishing",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    /// `done` and `error` are never claimed by a worker.
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    /// Mid-pipeline: picked up at least once and not finished.
    pub fn is_interrupted(self) -> bool {
        !self.is_finished() && self != TaskStatus::Created
    }

    /// Statuses owned by the marketplace stage. Partial remote state cannot be
    /// inspected, so work in these statuses is always restarted wholesale.
    pub fn is_remote(self) -> bool {
        matches!(
            self,
            TaskStatus::Uploading | TaskStatus::FillingForm | TaskStatus::Publishing
        )
    }

    /// Whether a task may move from `self` to `next`.
    ///
    /// `done` is final and `error` only leaves through an explicit retry back
    /// to `created`. Between in-flight statuses the worker normally moves
    /// forward; it steps back only to rebuild a checkpoint whose artifact
    /// vanished, or to restart the marketplace stage.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Done, _) => false,
            (TaskStatus::Error, TaskStatus::Created) => true,
            (TaskStatus::Error, _) => false,
            (_, TaskStatus::Created) => self == TaskStatus::Created,
            _ => true,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Full snapshot of a task row.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Task {
    pub id: TaskId,
    pub input_url: String,
    pub status: TaskStatus,
    pub step: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub download_path: Option<String>,
    pub extract_path: Option<String>,
    pub prepared_path: Option<String>,
    pub metadata: Option<ModelMetadata>,
    pub draft_id: Option<String>,
    pub product_url: Option<String>,
    pub error_message: Option<String>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&TaskStatus::FillingForm).unwrap();
        assert_eq!(json, "\"filling_form\"");
    }

    #[test]
    fn finished_statuses_only_leave_through_retry() {
        assert!(TaskStatus::Created.can_transition_to(TaskStatus::Downloading));
        assert!(TaskStatus::Downloading.can_transition_to(TaskStatus::Downloading));
        assert!(TaskStatus::Analyzing.can_transition_to(TaskStatus::Done));
        assert!(TaskStatus::Publishing.can_transition_to(TaskStatus::Error));
        assert!(TaskStatus::Publishing.can_transition_to(TaskStatus::Uploading));
        assert!(!TaskStatus::Extracting.can_transition_to(TaskStatus::Created));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Error));
        assert!(!TaskStatus::Error.can_transition_to(TaskStatus::Downloading));
        assert!(TaskStatus::Error.can_transition_to(TaskStatus::Created));
    }

    #[test]
    fn interrupted_excludes_created_and_finished() {
        let interrupted: Vec<_> = TaskStatus::ALL
            .into_iter()
            .filter(|s| s.is_interrupted())
            .collect();
        assert_eq!(interrupted.len(), 7);
        assert!(!interrupted.contains(&TaskStatus::Created));
    }

    #[test]
    fn task_id_is_non_empty_and_parses() {
        let id = TaskId::new();
        assert!(!id.to_string().is_empty());
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
    }
}
