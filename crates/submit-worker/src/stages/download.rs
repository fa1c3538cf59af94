use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;

use crate::{collaborators::Downloader, error::DownloadError};

const FALLBACK_FILE_NAME: &str = "download.zip";

/// Streams archives over HTTP(S) with a hard size cap.
pub struct HttpDownloader {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpDownloader {
    pub fn new(max_bytes: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("submit-worker/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self { client, max_bytes })
    }

    async fn stream_to(&self, url: Url, path: &Path) -> Result<u64, DownloadError> {
        let resp = self.client.get(url).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }
        if resp.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(DownloadError::TooLarge(self.max_bytes));
        }

        let mut f = tokio::fs::File::create(path).await.map_err(io)?;
        let mut total: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(from_reqwest)?;
            total = total.saturating_add(chunk.len() as u64);
            if total > self.max_bytes {
                return Err(DownloadError::TooLarge(self.max_bytes));
            }
            f.write_all(&chunk).await.map_err(io)?;
        }
        f.flush().await.map_err(io)?;
        f.sync_all().await.ok();
        Ok(total)
    }
}

#[async_trait::async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<PathBuf, DownloadError> {
        let parsed = Url::parse(url.trim()).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(url.to_string()));
        }

        tokio::fs::create_dir_all(dest_dir).await.map_err(io)?;
        let path = dest_dir.join(archive_file_name(&parsed));
        let tmp = path.with_extension("part");

        let outcome = match tokio::time::timeout(timeout, self.stream_to(parsed, &tmp)).await {
            Ok(res) => res,
            Err(_) => Err(DownloadError::Timeout),
        };
        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&tmp, &path).await.map_err(io)?;
        tracing::info!(path = %path.display(), bytes, "download complete");
        Ok(path)
    }
}

/// Last non-empty path segment of the URL, reduced to a safe file name.
pub(crate) fn archive_file_name(url: &Url) -> String {
    let name: String = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.trim_matches('.').is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name
    }
}

fn from_reqwest(e: reqwest::Error) -> DownloadError {
    if e.is_timeout() {
        return DownloadError::Timeout;
    }
    if let Some(status) = e.status() {
        return DownloadError::Status(status.as_u16());
    }
    DownloadError::Network(e.to_string())
}

fn io(e: std::io::Error) -> DownloadError {
    DownloadError::Io(e.to_string())
}
