use submit_core::{TaskId, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sea_orm::DbErr),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {id} has used {attempts} of {max_attempts} attempts")]
    AttemptsExhausted {
        id: TaskId,
        attempts: i32,
        max_attempts: i32,
    },

    #[error("task {id} has an unreadable {field}: {message}")]
    Corrupt {
        id: TaskId,
        field: &'static str,
        message: String,
    },
}

impl StoreError {
    /// The backend itself failed; callers back off and retry the whole cycle.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
