use submit_db::StoreError;

const MAX_MESSAGE_BYTES: usize = 2 * 1024;

/// Whether a failed stage may succeed if the task is picked up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid download url {0:?}")]
    InvalidUrl(String),
    #[error("server answered HTTP {0}")]
    Status(u16),
    #[error("download timed out")]
    Timeout,
    #[error("archive exceeds the {0} byte limit")]
    TooLarge(u64),
    #[error("network error: {0}")]
    Network(String),
    #[error("write failed: {0}")]
    Io(String),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::InvalidUrl(_) | DownloadError::TooLarge(_) => ErrorKind::Permanent,
            DownloadError::Status(code) => match code {
                408 | 425 | 429 => ErrorKind::Transient,
                400..=499 => ErrorKind::Permanent,
                _ => ErrorKind::Transient,
            },
            DownloadError::Timeout | DownloadError::Network(_) | DownloadError::Io(_) => {
                ErrorKind::Transient
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("archive is not a readable zip: {0}")]
    Corrupt(String),
    #[error("archive entry escapes the output directory: {0:?}")]
    UnsafePath(String),
    #[error("write failed: {0}")]
    Io(String),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Corrupt(_) | ExtractError::UnsafePath(_) => ErrorKind::Permanent,
            ExtractError::Io(_) => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("no files to upload after preparing {0}")]
    Empty(String),
    #[error("write failed: {0}")]
    Io(String),
}

impl PrepareError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrepareError::Empty(_) => ErrorKind::Permanent,
            PrepareError::Io(_) => ErrorKind::Transient,
        }
    }
}

/// Remote operation a publish failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Login,
    Upload,
    SubmitMetadata,
    Publish,
}

impl PublishStep {
    pub fn as_str(self) -> &'static str {
        match self {
            PublishStep::Login => "login",
            PublishStep::Upload => "upload",
            PublishStep::SubmitMetadata => "submit_metadata",
            PublishStep::Publish => "publish",
        }
    }
}

impl std::fmt::Display for PublishStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct PublishError {
    pub step: PublishStep,
    pub status: Option<u16>,
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "marketplace {} failed", self.step)?;
        if let Some(status) = self.status {
            write!(f, " (HTTP {status})")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for PublishError {}

impl PublishError {
    pub fn transient(step: PublishStep, message: impl Into<String>) -> Self {
        Self {
            step,
            status: None,
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(step: PublishStep, message: impl Into<String>) -> Self {
        Self {
            step,
            status: None,
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Classifies a non-success HTTP answer: server errors and throttling are
    /// worth another pickup, anything else is not.
    pub fn from_status(step: PublishStep, status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 | 429 => ErrorKind::Transient,
            500..=599 => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        };
        Self {
            step,
            status: Some(status),
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("extract failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("prepare failed: {0}")]
    Prepare(#[from] PrepareError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("{stage} cannot run: {what} is missing")]
    MissingInput {
        stage: &'static str,
        what: &'static str,
    },
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Download(e) => e.kind(),
            StageError::Extract(e) => e.kind(),
            StageError::Prepare(e) => e.kind(),
            StageError::Publish(e) => e.kind,
            // The next pickup re-routes to a stage that rebuilds the input.
            StageError::MissingInput { .. } => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One-line message stored in `error_message`, capped in size.
pub fn summarize(err: &dyn std::fmt::Display) -> String {
    let one_line = err
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    truncate_utf8(&one_line, MAX_MESSAGE_BYTES)
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_errors_split_on_http_class() {
        assert_eq!(DownloadError::Status(503).kind(), ErrorKind::Transient);
        assert_eq!(DownloadError::Status(429).kind(), ErrorKind::Transient);
        assert_eq!(DownloadError::Status(404).kind(), ErrorKind::Permanent);
        assert_eq!(DownloadError::Timeout.kind(), ErrorKind::Transient);
        assert_eq!(
            DownloadError::InvalidUrl("ftp://x".into()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn publish_error_names_step_and_status() {
        let err = PublishError::from_status(PublishStep::Upload, 502, "bad gateway");
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(
            err.to_string(),
            "marketplace upload failed (HTTP 502): bad gateway"
        );
        let err = PublishError::permanent(PublishStep::Login, "credentials rejected");
        assert_eq!(err.to_string(), "marketplace login failed: credentials rejected");
    }

    #[test]
    fn summary_is_single_line_and_bounded() {
        let long = format!("first\n\n  second\n{}", "é".repeat(4000));
        let s = summarize(&long);
        assert!(!s.contains('\n'));
        assert!(s.starts_with("first second"));
        assert!(s.len() <= MAX_MESSAGE_BYTES);
        assert!(s.ends_with("…(truncated)"));
    }

    #[test]
    fn truncate_utf8_keeps_char_boundaries() {
        let s = "ééééé";
        let out = truncate_utf8(s, 3);
        assert!(out.ends_with("…(truncated)"));
        assert!(out.is_char_boundary(out.len()));
        assert_eq!(truncate_utf8("short", 10), "short");
    }
}
