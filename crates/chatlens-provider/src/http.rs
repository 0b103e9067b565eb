use std::time::Duration;

use async_trait::async_trait;
use chatlens_schema::{AnalysisReport, ChatExport, ImageArtifact, VisualizationKind};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use crate::{AnalysisBackend, ApiError, ErrorKind};

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    pub(crate) api_base: String,
}

impl HttpBackend {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self::with_timeout(api_base, None)
    }

    /// Without a timeout a request waits for the service indefinitely.
    pub fn with_timeout(api_base: impl Into<String>, timeout: Option<Duration>) -> Self {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Self {
            client: builder.build().unwrap_or_default(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub message: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatReply {
    #[serde(default)]
    pub response: Option<String>,
}

/// FastAPI error body; `detail` is a string for raised errors, a list for validation errors.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServiceErrorBody {
    pub detail: serde_json::Value,
}

pub(crate) fn transport_error(err: reqwest::Error) -> ApiError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::Connect
    } else if err.is_decode() {
        ErrorKind::Decode
    } else {
        ErrorKind::Unknown
    };
    ApiError::transport(kind, err.to_string())
}

pub(crate) fn service_error(status: u16, body: &str) -> ApiError {
    let detail = serde_json::from_str::<ServiceErrorBody>(body)
        .ok()
        .map(|parsed| match parsed.detail {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.chars().take(200).collect())
        });
    ApiError::Service { status, detail }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(service_error(status.as_u16(), &text))
}

fn mime_for(export: &ChatExport) -> &'static str {
    match export.extension().as_deref() {
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl AnalysisBackend for HttpBackend {
    async fn analyze(&self, export: ChatExport) -> Result<AnalysisReport, ApiError> {
        let url = self.url("/api/analyze");
        let mime = mime_for(&export);
        tracing::debug!(
            file_name = %export.file_name,
            bytes = export.bytes.len(),
            "POST {url}"
        );

        let part = Part::bytes(export.bytes)
            .file_name(export.file_name)
            .mime_str(mime)
            .map_err(transport_error)?;
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = ensure_success(resp).await?;
        resp.json::<AnalysisReport>().await.map_err(transport_error)
    }

    async fn fetch_visualization(
        &self,
        kind: VisualizationKind,
    ) -> Result<ImageArtifact, ApiError> {
        let url = self.url(kind.path());
        tracing::debug!(%kind, "GET {url}");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = ensure_success(resp).await?;
        let body: serde_json::Value = resp.json().await.map_err(transport_error)?;

        match body.get(kind.response_field()) {
            Some(serde_json::Value::String(encoded)) if !encoded.is_empty() => {
                Ok(ImageArtifact::new(encoded.clone()))
            }
            _ => Err(ApiError::decode(format!(
                "response missing string field `{}`",
                kind.response_field()
            ))),
        }
    }

    async fn chat(&self, message: &str) -> Result<String, ApiError> {
        let url = self.url("/api/chatbot");
        tracing::debug!(chars = message.chars().count(), "POST {url}");

        let resp = self
            .client
            .post(url)
            .json(&ChatRequest { message })
            .send()
            .await
            .map_err(transport_error)?;
        let resp = ensure_success(resp).await?;
        let reply: ChatReply = resp.json().await.map_err(transport_error)?;

        match reply.response {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(ApiError::decode("response missing non-empty `response` field")),
        }
    }
}
