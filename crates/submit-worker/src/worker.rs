use std::path::Path;

use chrono::Utc;
use submit_core::{Task, TaskId, TaskStatus};
use submit_db::{StoreError, TaskStore, TaskUpdate};
use tokio::sync::watch;

use crate::{
    collaborators::{Collaborators, StartupSummary},
    config::WorkerConfig,
    error::{ErrorKind, StageError, WorkerError, summarize},
    routing::{Artifacts, Stage, resume_stage},
};

/// Single sequential executor: claims one task at a time and drives it
/// through the remaining stages, writing a checkpoint after each.
pub struct Worker {
    store: TaskStore,
    collaborators: Collaborators,
    config: WorkerConfig,
}

fn existing_input<'a>(
    stage: Stage,
    what: &'static str,
    path: Option<&'a str>,
) -> Result<&'a Path, StageError> {
    match path {
        Some(p) if !p.is_empty() && Path::new(p).exists() => Ok(Path::new(p)),
        _ => Err(StageError::MissingInput {
            stage: stage.name(),
            what,
        }),
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to remove task directory"),
    }
}

impl Worker {
    pub fn new(store: TaskStore, collaborators: Collaborators, config: WorkerConfig) -> Self {
        Self {
            store,
            collaborators,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Startup scan: reports interrupted tasks, frees claims whose lease ran
    /// out, and purges finished tasks past the retention window.
    pub async fn recover(&self) -> Result<StartupSummary, StoreError> {
        let interrupted = self.store.list_interrupted().await?;
        for task in &interrupted {
            tracing::info!(
                task_id = %task.id,
                status = %task.status,
                step = task.step.as_deref().unwrap_or(""),
                attempts = task.attempts,
                "found interrupted task"
            );
        }

        let released_claims = self.store.release_expired_claims().await?;
        if released_claims > 0 {
            tracing::info!(released_claims, "released stale claims");
        }

        let mut purged = 0;
        if self.config.retention_days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
            let removed = self.store.purge_finished(cutoff).await?;
            for id in &removed {
                remove_dir(&self.config.task_dir(*id)).await;
            }
            purged = removed.len();
            if purged > 0 {
                tracing::info!(purged, "purged old finished tasks");
            }
        }

        Ok(StartupSummary {
            worker_id: self.config.worker_id.clone(),
            interrupted: interrupted.iter().map(|t| (t.id, t.status)).collect(),
            released_claims,
            purged,
        })
    }

    /// Polls until `shutdown` flips to `true`. A task in progress always runs
    /// to the end of its pipeline before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.config.worker_id, "worker starting");
        match self.recover().await {
            Ok(summary) => self.collaborators.notifier.notify_started(&summary).await,
            Err(e) => tracing::error!(error = %e, "recovery scan failed"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "claim cycle failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    /// Claims and processes at most one task.
    pub async fn run_once(&self) -> Result<Option<TaskId>, StoreError> {
        let Some(task) = self
            .store
            .claim_next_pending(&self.config.worker_id)
            .await?
        else {
            return Ok(None);
        };
        let id = task.id;
        let outcome = tokio::select! {
            res = self.process(task) => res,
            _ = self.keep_lease(id) => Ok(()),
        };
        if let Err(e) = outcome {
            tracing::error!(task_id = %id, error = %e, "store failure while processing task");
            if let Err(e) = self.store.release_claim(id, &self.config.worker_id).await {
                tracing::warn!(task_id = %id, error = %e, "failed to release claim");
            }
        }
        Ok(Some(id))
    }

    /// Renews the claim on `id` for as long as it is polled.
    async fn keep_lease(&self, id: TaskId) {
        let mut tick = tokio::time::interval(self.config.heartbeat_interval());
        tick.tick().await;
        loop {
            tick.tick().await;
            match self.store.renew_lease(id, &self.config.worker_id).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(task_id = %id, "claim lost while processing"),
                Err(e) => tracing::warn!(task_id = %id, error = %e, "lease renewal failed"),
            }
        }
    }

    async fn process(&self, task: Task) -> Result<(), StoreError> {
        let id = task.id;
        let max_attempts = task.max_attempts;
        let attempts = self.store.increment_attempts(id).await?;
        if attempts > max_attempts {
            let message = format!("maximum attempts ({attempts}/{max_attempts}) exceeded");
            tracing::warn!(task_id = %id, attempts, max_attempts, "giving up on task");
            let step = task.step.clone().unwrap_or_else(|| task.status.to_string());
            self.store
                .update(
                    id,
                    TaskStatus::Error,
                    TaskUpdate::default().with_error(message.clone()),
                )
                .await?;
            self.collaborators
                .notifier
                .notify_error(id, &step, &message, attempts, max_attempts)
                .await;
            return Ok(());
        }

        let Some(start) = resume_stage(task.status, &Artifacts::probe(&task)) else {
            self.store.release_claim(id, &self.config.worker_id).await?;
            return Ok(());
        };
        tracing::info!(
            task_id = %id,
            status = %task.status,
            stage = %start,
            attempts,
            max_attempts,
            "processing task"
        );

        let mut task = task;
        let mut stage = Some(start);
        while let Some(current) = stage {
            match self.run_stage(current, &task).await {
                Ok(next) => task = next,
                Err(WorkerError::Stage(e)) => {
                    return self.record_failure(&task, current, e, attempts).await;
                }
                Err(WorkerError::Store(e)) => return Err(e),
            }
            stage = current.next();
        }

        self.finish(&task).await;
        Ok(())
    }

    async fn run_stage(&self, stage: Stage, task: &Task) -> Result<Task, WorkerError> {
        let id = task.id;
        let task_dir = self.config.task_dir(id);
        let c = &self.collaborators;
        let store = &self.store;

        let task = match stage {
            Stage::Download => {
                store
                    .update(id, stage.status(), TaskUpdate::step("downloading"))
                    .await?;
                let path = c
                    .downloader
                    .fetch(&task.input_url, &task_dir, self.config.download_timeout)
                    .await
                    .map_err(StageError::from)?;
                store
                    .update(
                        id,
                        TaskStatus::Downloading,
                        TaskUpdate::step("downloaded")
                            .with_download_path(path_string(&path))
                            .clearing_error(),
                    )
                    .await?
            }
            Stage::Extract => {
                let archive = existing_input(stage, "download_path", task.download_path.as_deref())?;
                store
                    .update(id, stage.status(), TaskUpdate::step("extracting"))
                    .await?;
                let out = c
                    .extractor
                    .unpack(archive, &task_dir.join("extracted"))
                    .await
                    .map_err(StageError::from)?;
                store
                    .update(
                        id,
                        TaskStatus::Extracting,
                        TaskUpdate::step("extracted")
                            .with_extract_path(path_string(&out))
                            .clearing_error(),
                    )
                    .await?
            }
            Stage::Prepare => {
                let extracted = existing_input(stage, "extract_path", task.extract_path.as_deref())?;
                store
                    .update(id, stage.status(), TaskUpdate::step("preparing"))
                    .await?;
                let out = c
                    .preparer
                    .reorganize(extracted, &task_dir.join("prepared"))
                    .await
                    .map_err(StageError::from)?;
                store
                    .update(
                        id,
                        TaskStatus::Preparing,
                        TaskUpdate::step("prepared")
                            .with_prepared_path(path_string(&out))
                            .clearing_error(),
                    )
                    .await?
            }
            Stage::Analyze => {
                let extracted = existing_input(stage, "extract_path", task.extract_path.as_deref())?;
                store
                    .update(id, stage.status(), TaskUpdate::step("analyzing"))
                    .await?;
                let metadata = c.metadata.analyze(extracted).await;
                tracing::info!(task_id = %id, title = %metadata.title, category = metadata.category.as_str(), "metadata ready");
                store
                    .update(
                        id,
                        TaskStatus::Analyzing,
                        TaskUpdate::step("analyzed")
                            .with_metadata(metadata)
                            .clearing_error(),
                    )
                    .await?
            }
            Stage::Publish => self.publish(task).await?,
        };
        Ok(task)
    }

    /// Remote work cannot be inspected, so publishing always starts over from
    /// login with a new draft.
    async fn publish(&self, task: &Task) -> Result<Task, WorkerError> {
        let id = task.id;
        let prepared = existing_input(Stage::Publish, "prepared_path", task.prepared_path.as_deref())?;
        let Some(metadata) = task.metadata.as_ref() else {
            return Err(StageError::MissingInput {
                stage: Stage::Publish.name(),
                what: "metadata",
            }
            .into());
        };
        if let Some(old) = task.draft_id.as_deref() {
            tracing::info!(task_id = %id, draft_id = old, "previous draft superseded by a new upload");
        }

        let store = &self.store;
        let marketplace = &self.collaborators.marketplace;

        store
            .update(id, TaskStatus::Uploading, TaskUpdate::step("uploading"))
            .await?;
        marketplace.login().await.map_err(StageError::from)?;
        store
            .update(
                id,
                TaskStatus::Uploading,
                TaskUpdate::step("logged_in").clearing_error(),
            )
            .await?;

        let draft_id = marketplace.upload(prepared).await.map_err(StageError::from)?;
        store
            .update(
                id,
                TaskStatus::FillingForm,
                TaskUpdate::step("files_uploaded")
                    .with_draft_id(draft_id.clone())
                    .clearing_error(),
            )
            .await?;

        marketplace
            .submit_metadata(&draft_id, metadata)
            .await
            .map_err(StageError::from)?;
        store
            .update(
                id,
                TaskStatus::Publishing,
                TaskUpdate::step("metadata_submitted"),
            )
            .await?;

        let product_url = marketplace.publish(&draft_id).await.map_err(StageError::from)?;
        let done = store
            .update(
                id,
                TaskStatus::Done,
                TaskUpdate::step("published").with_product_url(product_url),
            )
            .await?;
        Ok(done)
    }

    async fn record_failure(
        &self,
        task: &Task,
        stage: Stage,
        err: StageError,
        attempts: i32,
    ) -> Result<(), StoreError> {
        let id = task.id;
        let max_attempts = task.max_attempts;
        let message = summarize(&err);
        let kind = err.kind();

        if kind == ErrorKind::Transient && attempts < max_attempts {
            let delay = self.config.backoff_for(attempts);
            let retry_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            tracing::warn!(
                task_id = %id,
                stage = %stage,
                attempts,
                max_attempts,
                retry_in_secs = delay.as_secs(),
                error = %message,
                "stage failed, will retry"
            );
            self.store
                .schedule_retry(id, TaskUpdate::default().with_error(message.clone()), retry_at)
                .await?;
        } else {
            tracing::error!(
                task_id = %id,
                stage = %stage,
                attempts,
                max_attempts,
                transient = kind == ErrorKind::Transient,
                error = %message,
                "stage failed"
            );
            self.store
                .update(
                    id,
                    TaskStatus::Error,
                    TaskUpdate::default().with_error(message.clone()),
                )
                .await?;
        }

        self.collaborators
            .notifier
            .notify_error(id, stage.name(), &message, attempts, max_attempts)
            .await;
        Ok(())
    }

    async fn finish(&self, task: &Task) {
        tracing::info!(
            task_id = %task.id,
            product_url = task.product_url.as_deref().unwrap_or(""),
            "task published"
        );
        remove_dir(&self.config.task_dir(task.id)).await;
        self.collaborators.notifier.notify_done(task).await;
    }
}

fn path_string(p: &Path) -> String {
    p.display().to_string()
}
