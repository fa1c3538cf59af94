use std::time::Duration;

use anyhow::Context;
use submit_core::{Task, TaskId};

use crate::{
    collaborators::{Notifier, StartupSummary},
    config::TelegramConfig,
    error::truncate_utf8,
};

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_URL_CHARS: usize = 60;
const MAX_ERROR_BYTES: usize = 1000;

fn shorten(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

pub(crate) fn started_text(summary: &StartupSummary) -> String {
    format!(
        "Submit worker {} started\nInterrupted tasks: {}\nStale claims released: {}\nOld tasks purged: {}",
        summary.worker_id,
        summary.interrupted.len(),
        summary.released_claims,
        summary.purged
    )
}

pub(crate) fn created_text(task: &Task) -> String {
    format!(
        "New task {}\n{}",
        task.id,
        shorten(&task.input_url, MAX_URL_CHARS)
    )
}

pub(crate) fn done_text(task: &Task) -> String {
    let mut text = format!("Task {} completed", task.id);
    if let (Some(start), Some(end)) = (task.started_at, task.completed_at) {
        let secs = (end - start).num_seconds().max(0);
        text.push_str(&format!("\nDuration: {}m {}s", secs / 60, secs % 60));
    }
    if let Some(url) = task.product_url.as_deref() {
        text.push_str(&format!("\n{url}"));
    }
    text
}

pub(crate) fn error_text(
    task_id: TaskId,
    step: &str,
    error: &str,
    attempts: i32,
    max_attempts: i32,
) -> String {
    format!(
        "Task {task_id} failed\nStep: {step}\nAttempt: {attempts}/{max_attempts}\nError: {}",
        truncate_utf8(error, MAX_ERROR_BYTES)
    )
}

/// Sends notifications through the Telegram Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("build telegram http client")?;
        Ok(Self { client, config })
    }

    async fn send(&self, text: String) {
        let url = format!("{TELEGRAM_API}/bot{}/sendMessage", self.config.bot_token);
        let body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        let res = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = res {
            tracing::warn!(error = %e.without_url(), "telegram notification failed");
        }
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_started(&self, summary: &StartupSummary) {
        self.send(started_text(summary)).await;
    }

    async fn notify_created(&self, task: &Task) {
        self.send(created_text(task)).await;
    }

    async fn notify_done(&self, task: &Task) {
        self.send(done_text(task)).await;
    }

    async fn notify_error(
        &self,
        task_id: TaskId,
        step: &str,
        error: &str,
        attempts: i32,
        max_attempts: i32,
    ) {
        self.send(error_text(task_id, step, error, attempts, max_attempts))
            .await;
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify_started(&self, summary: &StartupSummary) {
        tracing::info!(
            worker_id = %summary.worker_id,
            interrupted = summary.interrupted.len(),
            released_claims = summary.released_claims,
            purged = summary.purged,
            "worker started"
        );
    }

    async fn notify_created(&self, task: &Task) {
        tracing::info!(task_id = %task.id, url = %task.input_url, "task created");
    }

    async fn notify_done(&self, task: &Task) {
        tracing::info!(
            task_id = %task.id,
            product_url = task.product_url.as_deref().unwrap_or(""),
            "task completed"
        );
    }

    async fn notify_error(
        &self,
        task_id: TaskId,
        step: &str,
        error: &str,
        attempts: i32,
        max_attempts: i32,
    ) {
        tracing::warn!(%task_id, step, attempts, max_attempts, error, "task failed");
    }
}
