use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
    prelude::{DateTimeWithTimeZone, Expr, Uuid},
};
use submit_core::{ModelMetadata, Task, TaskId, TaskStatus};

use crate::{StoreError, entities::tasks};

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_LEASE_SECS: i64 = 5 * 60;
const CLAIM_RACE_RETRIES: usize = 8;
const PENDING_PREVIEW: u64 = 10;

/// Fields written alongside a status change. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub step: Option<String>,
    pub download_path: Option<String>,
    pub extract_path: Option<String>,
    pub prepared_path: Option<String>,
    pub metadata: Option<ModelMetadata>,
    pub draft_id: Option<String>,
    pub product_url: Option<String>,
    pub error_message: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub clear_error: bool,
    pub release_claim: bool,
}

impl TaskUpdate {
    pub fn step(step: impl Into<String>) -> Self {
        Self {
            step: Some(step.into()),
            ..Self::default()
        }
    }

    pub fn with_download_path(mut self, path: impl Into<String>) -> Self {
        self.download_path = Some(path.into());
        self
    }

    pub fn with_extract_path(mut self, path: impl Into<String>) -> Self {
        self.extract_path = Some(path.into());
        self
    }

    pub fn with_prepared_path(mut self, path: impl Into<String>) -> Self {
        self.prepared_path = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, metadata: ModelMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_draft_id(mut self, draft_id: impl Into<String>) -> Self {
        self.draft_id = Some(draft_id.into());
        self
    }

    pub fn with_product_url(mut self, url: impl Into<String>) -> Self {
        self.product_url = Some(url.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_retry_after(mut self, at: DateTime<Utc>) -> Self {
        self.retry_after = Some(at);
        self
    }

    /// Drops the message and backoff left by an earlier failed pickup.
    pub fn clearing_error(mut self) -> Self {
        self.clear_error = true;
        self
    }

    pub fn releasing_claim(mut self) -> Self {
        self.release_claim = true;
        self
    }
}

/// How an errored task is put back in the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Keep checkpoints and the attempt count; refused once attempts are spent.
    #[default]
    Resume,
    /// Drop every checkpoint and reset attempts to zero.
    Fresh,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueSummary {
    pub counts: BTreeMap<String, i64>,
    pub total: i64,
    pub queue_length: i64,
    pub processing: Option<Task>,
    pub pending: Vec<Task>,
}

#[derive(Clone)]
pub struct TaskStore {
    db: Arc<DatabaseConnection>,
    max_attempts: i32,
    lease: Duration,
}

impl TaskStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn create(&self, input_url: &str) -> Result<Task, StoreError> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let model = tasks::ActiveModel {
            id: Set(Uuid::new_v4()),
            input_url: Set(input_url.to_string()),
            status: Set(TaskStatus::Created.as_str().to_string()),
            step: Set(None),
            error_message: Set(None),
            download_path: Set(None),
            extract_path: Set(None),
            prepared_path: Set(None),
            metadata_json: Set(None),
            draft_id: Set(None),
            product_url: Set(None),
            attempts: Set(0),
            max_attempts: Set(self.max_attempts),
            claimed_by: Set(None),
            lease_expires_at: Set(None),
            retry_after: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
        }
        .insert(self.db.as_ref())
        .await?;

        to_task(model)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        let model = tasks::Entity::find_by_id(id.0)
            .one(self.db.as_ref())
            .await?
            .ok_or(StoreError::NotFound(id))?;
        to_task(model)
    }

    /// Claims the oldest claimable task for `worker_id`.
    ///
    /// A task is claimable when it is not finished, its retry backoff has
    /// elapsed, and no live lease is held on it, whoever holds it. Status is
    /// left untouched; the caller decides where the task resumes. A claimed
    /// row that cannot be read is moved to `error` and skipped.
    pub async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
        for _ in 0..CLAIM_RACE_RETRIES {
            let now: DateTimeWithTimeZone = Utc::now().into();
            let Some(candidate) = tasks::Entity::find()
                .filter(claimable(now))
                .order_by_asc(tasks::Column::CreatedAt)
                .one(self.db.as_ref())
                .await?
            else {
                return Ok(None);
            };

            let lease_until: DateTimeWithTimeZone = (Utc::now() + self.lease).into();
            let res = tasks::Entity::update_many()
                .col_expr(tasks::Column::ClaimedBy, Expr::value(worker_id))
                .col_expr(tasks::Column::LeaseExpiresAt, Expr::value(lease_until))
                .filter(tasks::Column::Id.eq(candidate.id))
                .filter(claimable(now))
                .exec(self.db.as_ref())
                .await?;

            if res.rows_affected == 1 {
                match self.get(TaskId(candidate.id)).await {
                    Ok(task) => return Ok(Some(task)),
                    Err(StoreError::Corrupt { id, field, message }) => {
                        self.quarantine(id, field, &message).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            tracing::debug!(task_id = %candidate.id, "lost claim race, looking again");
        }
        Ok(None)
    }

    /// Parks an unreadable task in `error` with raw column writes, so it stops
    /// being claimable without going through the typed model.
    async fn quarantine(&self, id: TaskId, field: &str, message: &str) -> Result<(), StoreError> {
        tracing::error!(task_id = %id, field, error = message, "unreadable task moved to error");
        let now: DateTimeWithTimeZone = Utc::now().into();
        tasks::Entity::update_many()
            .col_expr(
                tasks::Column::Status,
                Expr::value(TaskStatus::Error.as_str()),
            )
            .col_expr(
                tasks::Column::ErrorMessage,
                Expr::value(format!("unreadable {field}: {message}")),
            )
            .col_expr(tasks::Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(
                tasks::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(tasks::Column::UpdatedAt, Expr::value(now))
            .filter(tasks::Column::Id.eq(id.0))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Pushes the lease of a task `worker_id` still holds. Returns `false`
    /// when the claim is gone.
    pub async fn renew_lease(&self, id: TaskId, worker_id: &str) -> Result<bool, StoreError> {
        let lease_until: DateTimeWithTimeZone = (Utc::now() + self.lease).into();
        let res = tasks::Entity::update_many()
            .col_expr(tasks::Column::LeaseExpiresAt, Expr::value(lease_until))
            .filter(tasks::Column::Id.eq(id.0))
            .filter(tasks::Column::ClaimedBy.eq(worker_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// Bumps the attempt counter and returns the new value.
    pub async fn increment_attempts(&self, id: TaskId) -> Result<i32, StoreError> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let txn = self.db.begin().await?;
        let res = tasks::Entity::update_many()
            .col_expr(
                tasks::Column::Attempts,
                Expr::col(tasks::Column::Attempts).add(1),
            )
            .col_expr(tasks::Column::UpdatedAt, Expr::value(now))
            .filter(tasks::Column::Id.eq(id.0))
            .exec(&txn)
            .await?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        let model = tasks::Entity::find_by_id(id.0)
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        txn.commit().await?;
        Ok(model.attempts)
    }

    /// Moves a task to `status` and writes the given fields in one
    /// transaction.
    ///
    /// `started_at` is stamped on the first move out of `created`, and
    /// `completed_at` on `done`. Finishing a task always drops its claim; an
    /// in-flight write by the claim holder extends the lease.
    pub async fn update(
        &self,
        id: TaskId,
        status: TaskStatus,
        patch: TaskUpdate,
    ) -> Result<Task, StoreError> {
        let txn = self.db.begin().await?;
        let model = tasks::Entity::find_by_id(id.0)
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let current = parse_status(&model)?;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current,
                to: status,
            });
        }

        let now = Utc::now();
        let already_started = model.started_at.is_some();
        let claimed = model.claimed_by.is_some();
        let mut active: tasks::ActiveModel = model.into();

        active.status = Set(status.as_str().to_string());
        active.updated_at = Set(now.into());
        if let Some(step) = patch.step {
            active.step = Set(Some(step));
        }
        if let Some(path) = patch.download_path {
            active.download_path = Set(Some(path));
        }
        if let Some(path) = patch.extract_path {
            active.extract_path = Set(Some(path));
        }
        if let Some(path) = patch.prepared_path {
            active.prepared_path = Set(Some(path));
        }
        if let Some(metadata) = patch.metadata {
            let json = serde_json::to_string(&metadata).map_err(|e| StoreError::Corrupt {
                id,
                field: "metadata",
                message: e.to_string(),
            })?;
            active.metadata_json = Set(Some(json));
        }
        if let Some(draft_id) = patch.draft_id {
            active.draft_id = Set(Some(draft_id));
        }
        if let Some(url) = patch.product_url {
            active.product_url = Set(Some(url));
        }
        if let Some(message) = &patch.error_message {
            active.error_message = Set(Some(message.clone()));
        }
        if patch.clear_error && patch.error_message.is_none() {
            active.error_message = Set(None);
            active.retry_after = Set(None);
        }
        if let Some(at) = patch.retry_after {
            active.retry_after = Set(Some(at.into()));
        }

        if !already_started && status != TaskStatus::Created {
            active.started_at = Set(Some(now.into()));
        }
        if status == TaskStatus::Done {
            active.completed_at = Set(Some(now.into()));
            active.error_message = Set(None);
            active.retry_after = Set(None);
        }

        if patch.release_claim || status.is_finished() {
            active.claimed_by = Set(None);
            active.lease_expires_at = Set(None);
        } else if claimed {
            active.lease_expires_at = Set(Some((now + self.lease).into()));
        }

        let model = active.update(&txn).await?;
        txn.commit().await?;
        to_task(model)
    }

    /// Records a transient failure without leaving the current status: the
    /// task keeps its checkpoints, gives up its claim, and becomes claimable
    /// again at `retry_after`.
    pub async fn schedule_retry(
        &self,
        id: TaskId,
        patch: TaskUpdate,
        retry_after: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let current = self.get(id).await?.status;
        self.update(
            id,
            current,
            patch.with_retry_after(retry_after).releasing_claim(),
        )
        .await
    }

    /// Drops `worker_id`'s claim on a task. A claim held by someone else is
    /// left alone.
    pub async fn release_claim(&self, id: TaskId, worker_id: &str) -> Result<(), StoreError> {
        tasks::Entity::update_many()
            .col_expr(tasks::Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(
                tasks::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .filter(tasks::Column::Id.eq(id.0))
            .filter(tasks::Column::ClaimedBy.eq(worker_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Clears claims whose lease ran out, typically left by a crashed worker.
    /// Live claims are never touched.
    pub async fn release_expired_claims(&self) -> Result<u64, StoreError> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let res = tasks::Entity::update_many()
            .col_expr(tasks::Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(
                tasks::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .filter(tasks::Column::ClaimedBy.is_not_null())
            .filter(tasks::Column::LeaseExpiresAt.lt(now))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }

    /// Puts an errored task back to `created`.
    pub async fn retry(&self, id: TaskId, policy: RetryPolicy) -> Result<Task, StoreError> {
        let txn = self.db.begin().await?;
        let model = tasks::Entity::find_by_id(id.0)
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let current = parse_status(&model)?;
        if current != TaskStatus::Error {
            return Err(StoreError::InvalidTransition {
                id,
                from: current,
                to: TaskStatus::Created,
            });
        }
        if policy == RetryPolicy::Resume && model.attempts >= model.max_attempts {
            return Err(StoreError::AttemptsExhausted {
                id,
                attempts: model.attempts,
                max_attempts: model.max_attempts,
            });
        }

        let mut active: tasks::ActiveModel = model.into();
        active.status = Set(TaskStatus::Created.as_str().to_string());
        active.step = Set(None);
        active.error_message = Set(None);
        active.retry_after = Set(None);
        active.started_at = Set(None);
        active.completed_at = Set(None);
        active.claimed_by = Set(None);
        active.lease_expires_at = Set(None);
        active.updated_at = Set(Utc::now().into());
        if policy == RetryPolicy::Fresh {
            active.attempts = Set(0);
            active.download_path = Set(None);
            active.extract_path = Set(None);
            active.prepared_path = Set(None);
            active.metadata_json = Set(None);
            active.draft_id = Set(None);
            active.product_url = Set(None);
        }

        let model = active.update(&txn).await?;
        txn.commit().await?;
        to_task(model)
    }

    /// Tasks that were picked up and never finished, oldest first.
    pub async fn list_interrupted(&self) -> Result<Vec<Task>, StoreError> {
        let rows = tasks::Entity::find()
            .filter(tasks::Column::Status.is_not_in(idle_statuses()))
            .order_by_asc(tasks::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(readable(rows))
    }

    pub async fn list_recent(&self, limit: u64) -> Result<Vec<Task>, StoreError> {
        let rows = tasks::Entity::find()
            .order_by_desc(tasks::Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        Ok(readable(rows))
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let rows = tasks::Entity::find()
            .filter(tasks::Column::Status.eq(status.as_str()))
            .order_by_asc(tasks::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(readable(rows))
    }

    pub async fn queue_summary(&self) -> Result<QueueSummary, StoreError> {
        let rows: Vec<(String, i64)> = tasks::Entity::find()
            .select_only()
            .column(tasks::Column::Status)
            .column_as(Expr::col(tasks::Column::Id).count(), "count")
            .group_by(tasks::Column::Status)
            .into_tuple()
            .all(self.db.as_ref())
            .await?;

        let mut counts: BTreeMap<String, i64> = TaskStatus::ALL
            .into_iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for (status, count) in rows {
            counts.insert(status, count);
        }
        let total = counts.values().sum();
        let queue_length = counts
            .get(TaskStatus::Created.as_str())
            .copied()
            .unwrap_or(0);

        let processing = tasks::Entity::find()
            .filter(tasks::Column::Status.is_not_in(idle_statuses()))
            .order_by_asc(tasks::Column::CreatedAt)
            .one(self.db.as_ref())
            .await?
            .and_then(|m| readable(vec![m]).pop());

        let pending = readable(
            tasks::Entity::find()
                .filter(tasks::Column::Status.eq(TaskStatus::Created.as_str()))
                .order_by_asc(tasks::Column::CreatedAt)
                .limit(PENDING_PREVIEW)
                .all(self.db.as_ref())
                .await?,
        );

        Ok(QueueSummary {
            counts,
            total,
            queue_length,
            processing,
            pending,
        })
    }

    /// Deletes `done` and `error` tasks created before `older_than` and returns
    /// their ids so the caller can remove their working directories.
    pub async fn purge_finished(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let cutoff: DateTimeWithTimeZone = older_than.into();
        let ids: Vec<Uuid> = tasks::Entity::find()
            .select_only()
            .column(tasks::Column::Id)
            .filter(tasks::Column::Status.is_in(finished_statuses()))
            .filter(tasks::Column::CreatedAt.lt(cutoff))
            .into_tuple()
            .all(self.db.as_ref())
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        tasks::Entity::delete_many()
            .filter(tasks::Column::Id.is_in(ids.clone()))
            .exec(self.db.as_ref())
            .await?;
        Ok(ids.into_iter().map(TaskId).collect())
    }
}

fn finished_statuses() -> [&'static str; 2] {
    [TaskStatus::Done.as_str(), TaskStatus::Error.as_str()]
}

fn idle_statuses() -> [&'static str; 3] {
    [
        TaskStatus::Created.as_str(),
        TaskStatus::Done.as_str(),
        TaskStatus::Error.as_str(),
    ]
}

fn claimable(now: DateTimeWithTimeZone) -> Condition {
    Condition::all()
        .add(tasks::Column::Status.is_not_in(finished_statuses()))
        .add(
            Condition::any()
                .add(tasks::Column::RetryAfter.is_null())
                .add(tasks::Column::RetryAfter.lte(now)),
        )
        .add(
            Condition::any()
                .add(tasks::Column::ClaimedBy.is_null())
                .add(tasks::Column::LeaseExpiresAt.lt(now)),
        )
}

fn parse_status(model: &tasks::Model) -> Result<TaskStatus, StoreError> {
    model
        .status
        .parse::<TaskStatus>()
        .map_err(|e| StoreError::Corrupt {
            id: TaskId(model.id),
            field: "status",
            message: e.to_string(),
        })
}

fn utc(ts: DateTimeWithTimeZone) -> DateTime<Utc> {
    ts.with_timezone(&Utc)
}

/// Converts rows for read-only listings, leaving out rows that cannot be read.
fn readable(rows: Vec<tasks::Model>) -> Vec<Task> {
    rows.into_iter()
        .filter_map(|m| match to_task(m) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable task row");
                None
            }
        })
        .collect()
}

fn to_task(model: tasks::Model) -> Result<Task, StoreError> {
    let id = TaskId(model.id);
    let status = parse_status(&model)?;
    let metadata = match model.metadata_json.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(serde_json::from_str::<ModelMetadata>(raw).map_err(|e| {
            StoreError::Corrupt {
                id,
                field: "metadata",
                message: e.to_string(),
            }
        })?),
    };

    Ok(Task {
        id,
        input_url: model.input_url,
        status,
        step: model.step,
        attempts: model.attempts,
        max_attempts: model.max_attempts,
        download_path: model.download_path,
        extract_path: model.extract_path,
        prepared_path: model.prepared_path,
        metadata,
        draft_id: model.draft_id,
        product_url: model.product_url,
        error_message: model.error_message,
        claimed_by: model.claimed_by,
        lease_expires_at: model.lease_expires_at.map(utc),
        retry_after: model.retry_after.map(utc),
        created_at: utc(model.created_at),
        updated_at: utc(model.updated_at),
        started_at: model.started_at.map(utc),
        completed_at: model.completed_at.map(utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use submit_migration::{Migrator, MigratorTrait};

    async fn open_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("tasks.db").display());
        let db = crate::connect(&url).await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        (dir, TaskStore::new(Arc::new(db)))
    }

    async fn create_in(store: &TaskStore, status: TaskStatus) -> Task {
        let task = store.create("https://files.example/model.zip").await.unwrap();
        if status == TaskStatus::Created {
            return task;
        }
        store
            .update(task.id, status, TaskUpdate::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn created_task_starts_clean() {
        let (_dir, store) = open_store().await;
        let task = store.create("https://files.example/a.zip").await.unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(task.started_at.is_none());

        let fetched = store.get(task.id).await.unwrap();
        assert_eq!(fetched.input_url, "https://files.example/a.zip");
        assert!(matches!(
            store.get(TaskId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn claim_skips_finished_tasks() {
        let (_dir, store) = open_store().await;
        create_in(&store, TaskStatus::Done).await;
        create_in(&store, TaskStatus::Error).await;
        assert!(store.claim_next_pending("w1").await.unwrap().is_none());

        let pending = create_in(&store, TaskStatus::Created).await;
        let claimed = store.claim_next_pending("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, pending.id);
        assert_eq!(claimed.status, TaskStatus::Created);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn claim_prefers_oldest_and_is_exclusive() {
        let (_dir, store) = open_store().await;
        let first = create_in(&store, TaskStatus::Extracting).await;
        let second = create_in(&store, TaskStatus::Created).await;

        let a = store.claim_next_pending("w1").await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        let b = store.claim_next_pending("w2").await.unwrap().unwrap();
        assert_eq!(b.id, second.id);
        assert!(store.claim_next_pending("w3").await.unwrap().is_none());

        // A live lease blocks even its own holder id.
        assert!(store.claim_next_pending("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_with_one_id_get_distinct_tasks() {
        let (_dir, store) = open_store().await;
        let only = create_in(&store, TaskStatus::Created).await;

        let (a, b) = tokio::join!(
            store.claim_next_pending("host-worker"),
            store.claim_next_pending("host-worker")
        );
        let won: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(won.len(), 1);
        assert_eq!(won[0].id, only.id);
    }

    #[tokio::test]
    async fn renewing_keeps_the_claim_live() {
        let (_dir, store) = open_store().await;
        let short = store.clone().with_lease(Duration::seconds(-1));
        let task = create_in(&store, TaskStatus::Created).await;
        short.claim_next_pending("w1").await.unwrap().unwrap();

        assert!(!store.renew_lease(task.id, "w2").await.unwrap());
        assert!(store.renew_lease(task.id, "w1").await.unwrap());
        assert!(store.claim_next_pending("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (_dir, store) = open_store().await;
        let store = store.with_lease(Duration::seconds(-1));
        let task = create_in(&store, TaskStatus::Created).await;
        store.claim_next_pending("w1").await.unwrap().unwrap();

        let taken = store.claim_next_pending("w2").await.unwrap().unwrap();
        assert_eq!(taken.id, task.id);
        assert_eq!(taken.claimed_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn retry_after_holds_a_task_back() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Downloading).await;
        store.claim_next_pending("w1").await.unwrap().unwrap();
        let held = store
            .schedule_retry(
                task.id,
                TaskUpdate::default().with_error("connection reset"),
                Utc::now() + Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(held.status, TaskStatus::Downloading);
        assert!(held.claimed_by.is_none());
        assert_eq!(held.error_message.as_deref(), Some("connection reset"));
        assert!(store.claim_next_pending("w1").await.unwrap().is_none());

        store
            .update(
                task.id,
                TaskStatus::Downloading,
                TaskUpdate::default().with_retry_after(Utc::now() - Duration::seconds(1)),
            )
            .await
            .unwrap();
        assert!(store.claim_next_pending("w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn attempts_increment_by_one() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Created).await;
        assert_eq!(store.increment_attempts(task.id).await.unwrap(), 1);
        assert_eq!(store.increment_attempts(task.id).await.unwrap(), 2);
        assert!(matches!(
            store.increment_attempts(TaskId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_stamps_lifecycle_times() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Created).await;

        let downloading = store
            .update(
                task.id,
                TaskStatus::Downloading,
                TaskUpdate::step("downloading"),
            )
            .await
            .unwrap();
        let started = downloading.started_at.expect("started_at set");
        assert_eq!(downloading.step.as_deref(), Some("downloading"));

        let extracting = store
            .update(
                task.id,
                TaskStatus::Extracting,
                TaskUpdate::step("downloaded").with_download_path("/data/a.zip"),
            )
            .await
            .unwrap();
        assert_eq!(extracting.started_at, Some(started));
        assert_eq!(extracting.download_path.as_deref(), Some("/data/a.zip"));

        let done = store
            .update(
                task.id,
                TaskStatus::Done,
                TaskUpdate::step("published").with_product_url("https://market/p/1"),
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(done.error_message.is_none());
        assert!(done.updated_at >= extracting.updated_at);
    }

    #[tokio::test]
    async fn metadata_survives_storage() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Analyzing).await;
        let metadata = ModelMetadata {
            title: "Oak Tree".to_string(),
            ..ModelMetadata::default()
        };
        store
            .update(
                task.id,
                TaskStatus::Uploading,
                TaskUpdate::step("analyzed").with_metadata(metadata.clone()),
            )
            .await
            .unwrap();
        assert_eq!(store.get(task.id).await.unwrap().metadata, Some(metadata));
    }

    #[tokio::test]
    async fn done_tasks_cannot_move() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Done).await;
        let err = store
            .update(task.id, TaskStatus::Error, TaskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn finishing_drops_the_claim() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Created).await;
        store.claim_next_pending("w1").await.unwrap().unwrap();
        let errored = store
            .update(
                task.id,
                TaskStatus::Error,
                TaskUpdate::default().with_error("bad archive"),
            )
            .await
            .unwrap();
        assert!(errored.claimed_by.is_none());
        assert!(errored.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn resume_retry_keeps_checkpoints_and_attempts() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Created).await;
        store.increment_attempts(task.id).await.unwrap();
        store
            .update(
                task.id,
                TaskStatus::Error,
                TaskUpdate::step("preparing")
                    .with_download_path("/data/a.zip")
                    .with_error("disk full"),
            )
            .await
            .unwrap();

        let retried = store.retry(task.id, RetryPolicy::Resume).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Created);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.download_path.as_deref(), Some("/data/a.zip"));
        assert!(retried.error_message.is_none());
        assert!(retried.step.is_none());
        assert!(retried.started_at.is_none());
    }

    #[tokio::test]
    async fn retry_requires_error_status() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Downloading).await;
        let err = store.retry(task.id, RetryPolicy::Resume).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: TaskStatus::Downloading,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn exhausted_task_only_retries_fresh() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Created).await;
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            store.increment_attempts(task.id).await.unwrap();
        }
        store
            .update(
                task.id,
                TaskStatus::Error,
                TaskUpdate::default().with_extract_path("/data/x"),
            )
            .await
            .unwrap();

        let err = store.retry(task.id, RetryPolicy::Resume).await.unwrap_err();
        assert!(matches!(err, StoreError::AttemptsExhausted { .. }));

        let fresh = store.retry(task.id, RetryPolicy::Fresh).await.unwrap();
        assert_eq!(fresh.attempts, 0);
        assert!(fresh.extract_path.is_none());
    }

    #[tokio::test]
    async fn interrupted_lists_only_in_flight_tasks() {
        let (_dir, store) = open_store().await;
        create_in(&store, TaskStatus::Created).await;
        create_in(&store, TaskStatus::Done).await;
        let a = create_in(&store, TaskStatus::Preparing).await;
        let b = create_in(&store, TaskStatus::Publishing).await;

        let ids: Vec<_> = store
            .list_interrupted()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let (_dir, store) = open_store().await;
        create_in(&store, TaskStatus::Created).await;
        let b = create_in(&store, TaskStatus::Created).await;
        let c = create_in(&store, TaskStatus::Created).await;

        let recent = store.list_recent(2).await.unwrap();
        let ids: Vec<_> = recent.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![c.id, b.id]);
        assert_eq!(
            store.list_by_status(TaskStatus::Created).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn queue_summary_counts_every_status() {
        let (_dir, store) = open_store().await;
        create_in(&store, TaskStatus::Created).await;
        create_in(&store, TaskStatus::Created).await;
        let running = create_in(&store, TaskStatus::Analyzing).await;
        create_in(&store, TaskStatus::Error).await;

        let summary = store.queue_summary().await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.queue_length, 2);
        assert_eq!(summary.counts["created"], 2);
        assert_eq!(summary.counts["analyzing"], 1);
        assert_eq!(summary.counts["done"], 0);
        assert_eq!(summary.processing.map(|t| t.id), Some(running.id));
        assert_eq!(summary.pending.len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_old_finished_tasks() {
        let (_dir, store) = open_store().await;
        let done = create_in(&store, TaskStatus::Done).await;
        let errored = create_in(&store, TaskStatus::Error).await;
        let live = create_in(&store, TaskStatus::Extracting).await;

        let nothing = store
            .purge_finished(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert!(nothing.is_empty());

        let purged = store
            .purge_finished(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        let mut ids: Vec<_> = purged.into_iter().map(|id| id.0).collect();
        ids.sort();
        let mut expected = vec![done.id.0, errored.id.0];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(store.get(live.id).await.is_ok());
        assert!(store.get(done.id).await.is_err());
    }

    #[tokio::test]
    async fn only_expired_claims_are_released() {
        let (_dir, store) = open_store().await;
        let live = create_in(&store, TaskStatus::Created).await;
        store.claim_next_pending("w1").await.unwrap().unwrap();
        let stale = create_in(&store, TaskStatus::Downloading).await;
        store
            .clone()
            .with_lease(Duration::seconds(-1))
            .claim_next_pending("crashed")
            .await
            .unwrap()
            .unwrap();

        store.release_claim(live.id, "w2").await.unwrap();
        assert_eq!(store.release_expired_claims().await.unwrap(), 1);

        assert_eq!(
            store.get(live.id).await.unwrap().claimed_by.as_deref(),
            Some("w1")
        );
        assert!(store.get(stale.id).await.unwrap().claimed_by.is_none());
    }

    async fn corrupt_metadata(store: &TaskStore, id: TaskId) {
        tasks::Entity::update_many()
            .col_expr(tasks::Column::MetadataJson, Expr::value("{not json"))
            .filter(tasks::Column::Id.eq(id.0))
            .exec(store.connection())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreadable_task_is_parked_and_the_next_one_claimed() {
        let (_dir, store) = open_store().await;
        let bad = create_in(&store, TaskStatus::Created).await;
        corrupt_metadata(&store, bad.id).await;
        let good = create_in(&store, TaskStatus::Created).await;

        for _ in 0..3 {
            if let Some(task) = store.claim_next_pending("w1").await.unwrap() {
                assert_eq!(task.id, good.id);
                store
                    .update(task.id, TaskStatus::Done, TaskUpdate::step("published"))
                    .await
                    .unwrap();
            }
        }

        assert_eq!(store.get(good.id).await.unwrap().status, TaskStatus::Done);
        let parked = tasks::Entity::find_by_id(bad.id.0)
            .one(store.connection())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.status, "error");
        assert!(parked.error_message.unwrap().contains("metadata"));
        assert!(parked.claimed_by.is_none());
        assert!(store.claim_next_pending("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listings_skip_unreadable_rows() {
        let (_dir, store) = open_store().await;
        let bad = create_in(&store, TaskStatus::Extracting).await;
        corrupt_metadata(&store, bad.id).await;
        let good = create_in(&store, TaskStatus::Created).await;

        let recent: Vec<_> = store
            .list_recent(10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(recent, vec![good.id]);
        assert!(store.list_interrupted().await.unwrap().is_empty());

        let summary = store.queue_summary().await.unwrap();
        assert_eq!(summary.total, 2);
        assert!(summary.processing.is_none());
        assert_eq!(summary.pending.len(), 1);
    }

    #[tokio::test]
    async fn clearing_error_drops_leftovers_of_a_failed_pickup() {
        let (_dir, store) = open_store().await;
        let task = create_in(&store, TaskStatus::Downloading).await;
        store
            .schedule_retry(
                task.id,
                TaskUpdate::default().with_error("HTTP 503"),
                Utc::now(),
            )
            .await
            .unwrap();

        let kept = store
            .update(task.id, TaskStatus::Extracting, TaskUpdate::step("extracting"))
            .await
            .unwrap();
        assert_eq!(kept.error_message.as_deref(), Some("HTTP 503"));

        let cleared = store
            .update(
                task.id,
                TaskStatus::Extracting,
                TaskUpdate::step("extracted")
                    .with_extract_path("/tmp/x")
                    .clearing_error(),
            )
            .await
            .unwrap();
        assert!(cleared.error_message.is_none());
        assert!(cleared.retry_after.is_none());
    }
}
