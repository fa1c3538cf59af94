use std::{path::PathBuf, time::Duration};

use submit_core::TaskId;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_CLAIM_LEASE_SECS: u64 = 5 * 60;
const DEFAULT_RETRY_BACKOFF_SECS: u64 = 30;
const DEFAULT_RETRY_BACKOFF_MAX_SECS: u64 = 15 * 60;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_DOWNLOAD_MAX_BYTES: u64 = 8 * 1024 * 1024 * 1024; // 8 GiB
const DEFAULT_RETENTION_DAYS: i64 = 30;
const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MARKETPLACE_TIMEOUT_SECS: u64 = 5 * 60;

pub(crate) fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_str(name).and_then(|v| v.parse::<u64>().ok())
}

/// Claim owner for this process: the configured name plus the pid and a
/// random suffix, so two processes sharing a name never share claims.
pub fn instance_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{name}-{}-{}", std::process::id(), &suffix[..8])
}

fn absolutize(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}

/// Settings of the worker loop and the local stages.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub data_root: PathBuf,
    pub poll_interval: Duration,
    pub max_attempts: i32,
    pub claim_lease: Duration,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub download_timeout: Duration,
    pub download_max_bytes: u64,
    pub retention_days: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: instance_id("worker"),
            data_root: PathBuf::from("./data"),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            claim_lease: Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS),
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
            retry_backoff_max: Duration::from_secs(DEFAULT_RETRY_BACKOFF_MAX_SECS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            download_max_bytes: DEFAULT_DOWNLOAD_MAX_BYTES,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let worker_id = instance_id(
            &env_str("SUBMIT_WORKER_ID")
                .or_else(|| env_str("HOSTNAME"))
                .unwrap_or_else(|| "worker".to_string()),
        );
        let data_root = absolutize(
            env_str("SUBMIT_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.data_root),
        );
        let secs = |name: &str, default: Duration| {
            env_u64(name).map(Duration::from_secs).unwrap_or(default)
        };

        Self {
            worker_id,
            data_root,
            poll_interval: secs("SUBMIT_POLL_INTERVAL_SECS", d.poll_interval)
                .max(Duration::from_secs(1)),
            max_attempts: env_u64("SUBMIT_MAX_ATTEMPTS")
                .map(|v| v.clamp(1, 100) as i32)
                .unwrap_or(d.max_attempts),
            claim_lease: secs("SUBMIT_CLAIM_LEASE_SECS", d.claim_lease)
                .max(Duration::from_secs(60)),
            retry_backoff: secs("SUBMIT_RETRY_BACKOFF_SECS", d.retry_backoff),
            retry_backoff_max: secs("SUBMIT_RETRY_BACKOFF_MAX_SECS", d.retry_backoff_max),
            download_timeout: secs("SUBMIT_DOWNLOAD_TIMEOUT_SECS", d.download_timeout),
            download_max_bytes: env_u64("SUBMIT_DOWNLOAD_MAX_BYTES")
                .unwrap_or(d.download_max_bytes),
            retention_days: env_u64("SUBMIT_RETENTION_DAYS")
                .map(|v| v as i64)
                .unwrap_or(d.retention_days),
        }
    }

    /// How often a held lease is renewed while a task runs.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.claim_lease / 3).max(Duration::from_secs(1))
    }

    /// Working directory owned by one task.
    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.data_root.join("tasks").join(id.to_string())
    }

    /// Delay before a transiently failed task may be claimed again:
    /// `retry_backoff * 2^(attempts-1)`, capped at `retry_backoff_max`.
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        let exp = attempts.saturating_sub(1).clamp(0, 16) as u32;
        self.retry_backoff
            .saturating_mul(1u32 << exp)
            .min(self.retry_backoff_max)
    }
}

/// Marketplace account and endpoint.
#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
    pub base_url: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            email: None,
            password: None,
            timeout: Duration::from_secs(DEFAULT_MARKETPLACE_TIMEOUT_SECS),
        }
    }
}

impl MarketplaceConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_str("MARKETPLACE_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            email: env_str("MARKETPLACE_EMAIL"),
            password: env_str("MARKETPLACE_PASSWORD"),
            timeout: Duration::from_secs(
                env_u64("MARKETPLACE_TIMEOUT_SECS").unwrap_or(DEFAULT_MARKETPLACE_TIMEOUT_SECS),
            ),
        }
    }
}

/// OpenAI-compatible vision endpoint used to describe the preview image.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            timeout: Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS),
        }
    }
}

impl VisionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_key: env_str("OPENAI_API_KEY"),
            base_url: env_str("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.base_url),
            model: env_str("OPENAI_MODEL").unwrap_or(d.model),
            timeout: d.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    /// `None` unless both the token and the chat id are set.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            bot_token: env_str("TELEGRAM_BOT_TOKEN")?,
            chat_id: env_str("TELEGRAM_CHAT_ID")?,
        })
    }
}
