//! Boundaries between the worker and the outside world. The worker only sees
//! these traits; the concrete clients live in [`crate::stages`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use submit_core::{ModelMetadata, Task, TaskId, TaskStatus};

use crate::error::{DownloadError, ExtractError, PrepareError, PublishError};

#[async_trait::async_trait]
pub trait Downloader: Send + Sync {
    /// Streams `url` into a file inside `dest_dir` and returns its path.
    async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<PathBuf, DownloadError>;
}

#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    /// Unpacks `archive` into `dest`, replacing whatever `dest` held.
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<PathBuf, ExtractError>;
}

#[async_trait::async_trait]
pub trait Preparer: Send + Sync {
    /// Builds the upload layout of `extract_dir` inside `dest`.
    async fn reorganize(&self, extract_dir: &Path, dest: &Path) -> Result<PathBuf, PrepareError>;
}

#[async_trait::async_trait]
pub trait MetadataGenerator: Send + Sync {
    /// Never fails: implementations fall back to [`ModelMetadata::default`].
    async fn analyze(&self, extract_dir: &Path) -> ModelMetadata;
}

#[async_trait::async_trait]
pub trait Marketplace: Send + Sync {
    async fn login(&self) -> Result<(), PublishError>;
    /// Uploads every file of `dir` into a new draft and returns its id.
    async fn upload(&self, dir: &Path) -> Result<String, PublishError>;
    async fn submit_metadata(
        &self,
        draft_id: &str,
        metadata: &ModelMetadata,
    ) -> Result<(), PublishError>;
    /// Publishes the draft and returns the public product URL.
    async fn publish(&self, draft_id: &str) -> Result<String, PublishError>;
}

/// What the recovery scan found at startup.
#[derive(Debug, Clone, Default)]
pub struct StartupSummary {
    pub worker_id: String,
    pub interrupted: Vec<(TaskId, TaskStatus)>,
    pub released_claims: u64,
    pub purged: usize,
}

/// Operator notifications. Delivery is best effort: implementations log
/// their own failures and never report them to the worker.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_started(&self, summary: &StartupSummary);
    async fn notify_created(&self, task: &Task);
    async fn notify_done(&self, task: &Task);
    async fn notify_error(
        &self,
        task_id: TaskId,
        step: &str,
        error: &str,
        attempts: i32,
        max_attempts: i32,
    );
}

#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn Downloader>,
    pub extractor: Arc<dyn Extractor>,
    pub preparer: Arc<dyn Preparer>,
    pub metadata: Arc<dyn MetadataGenerator>,
    pub marketplace: Arc<dyn Marketplace>,
    pub notifier: Arc<dyn Notifier>,
}
