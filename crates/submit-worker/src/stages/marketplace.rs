use std::path::Path;

use anyhow::Context;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use submit_core::ModelMetadata;

use crate::{
    collaborators::Marketplace,
    config::MarketplaceConfig,
    error::{PublishError, PublishStep},
};

/// Client for a marketplace exposing a JSON draft API behind a cookie
/// session:
///
/// - `POST /api/session` with `{email, password}`
/// - `POST /api/drafts` multipart upload, answers `{id}`
/// - `PUT /api/drafts/{id}/metadata` with the listing record
/// - `POST /api/drafts/{id}/publish`, answers `{url}`
pub struct HttpMarketplace {
    client: reqwest::Client,
    config: MarketplaceConfig,
}

impl HttpMarketplace {
    pub fn new(config: MarketplaceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("submit-worker/", env!("CARGO_PKG_VERSION")))
            .cookie_store(true)
            .timeout(config.timeout)
            .build()
            .context("build marketplace http client")?;
        Ok(Self { client, config })
    }

    fn url(&self, step: PublishStep, path: &str) -> Result<String, PublishError> {
        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| PublishError::permanent(step, "MARKETPLACE_BASE_URL is not set"))?;
        Ok(format!("{base}{path}"))
    }

    async fn send(
        &self,
        step: PublishStep,
        req: reqwest::RequestBuilder,
    ) -> Result<Value, PublishError> {
        let resp = req
            .send()
            .await
            .map_err(|e| PublishError::transient(step, e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PublishError::transient(step, e.to_string()))?;
        if !status.is_success() {
            let detail = text.trim();
            let detail = if detail.is_empty() {
                status.canonical_reason().unwrap_or("request failed")
            } else {
                detail
            };
            return Err(PublishError::from_status(
                step,
                status.as_u16(),
                crate::error::truncate_utf8(detail, 512),
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| PublishError::permanent(step, format!("unreadable response: {e}")))
    }
}

fn required_str(step: PublishStep, v: &Value, key: &str) -> Result<String, PublishError> {
    v.get(key)
        .and_then(|x| match x {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PublishError::permanent(step, format!("response has no {key:?}")))
}

#[async_trait::async_trait]
impl Marketplace for HttpMarketplace {
    async fn login(&self) -> Result<(), PublishError> {
        let step = PublishStep::Login;
        let url = self.url(step, "/api/session")?;
        let (Some(email), Some(password)) = (
            self.config.email.as_deref(),
            self.config.password.as_deref(),
        ) else {
            return Err(PublishError::permanent(
                step,
                "MARKETPLACE_EMAIL and MARKETPLACE_PASSWORD must be set",
            ));
        };
        let body = serde_json::json!({ "email": email, "password": password });
        match self.send(step, self.client.post(url).json(&body)).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.status, Some(401 | 403)) => {
                Err(PublishError::permanent(step, "credentials rejected"))
            }
            Err(e) => Err(e),
        }
    }

    async fn upload(&self, dir: &Path) -> Result<String, PublishError> {
        let step = PublishStep::Upload;
        let url = self.url(step, "/api/drafts")?;
        let io = |e: std::io::Error| PublishError::transient(step, e.to_string());

        let mut files = Vec::new();
        let mut rd = tokio::fs::read_dir(dir).await.map_err(io)?;
        while let Some(entry) = rd.next_entry().await.map_err(io)? {
            if entry.file_type().await.map_err(io)?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(PublishError::permanent(
                step,
                format!("nothing to upload in {}", dir.display()),
            ));
        }

        let mut form = Form::new();
        for path in &files {
            let name = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("file")
                .to_string();
            let file = tokio::fs::File::open(path).await.map_err(io)?;
            let len = file.metadata().await.map_err(io)?.len();
            let part = Part::stream_with_length(reqwest::Body::from(file), len).file_name(name);
            form = form.part("files[]", part);
        }
        tracing::info!(files = files.len(), "uploading draft files");

        let resp = self.send(step, self.client.post(url).multipart(form)).await?;
        required_str(step, &resp, "id")
    }

    async fn submit_metadata(
        &self,
        draft_id: &str,
        metadata: &ModelMetadata,
    ) -> Result<(), PublishError> {
        let step = PublishStep::SubmitMetadata;
        let url = self.url(step, &format!("/api/drafts/{draft_id}/metadata"))?;
        self.send(step, self.client.put(url).json(metadata)).await?;
        Ok(())
    }

    async fn publish(&self, draft_id: &str) -> Result<String, PublishError> {
        let step = PublishStep::Publish;
        let url = self.url(step, &format!("/api/drafts/{draft_id}/publish"))?;
        let resp = self.send(step, self.client.post(url)).await?;
        required_str(step, &resp, "url")
    }
}
