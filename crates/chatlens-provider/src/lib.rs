pub mod http;

use async_trait::async_trait;
use chatlens_schema::{AnalysisReport, ChatExport, ImageArtifact, VisualizationKind};
use thiserror::Error;

pub use http::HttpBackend;

/// The remote analysis service and assistant, as seen by the client core.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// `POST /api/analyze` with the export as multipart field `file`.
    async fn analyze(&self, export: ChatExport) -> Result<AnalysisReport, ApiError>;

    /// `GET` the endpoint of one supplementary chart.
    async fn fetch_visualization(
        &self,
        kind: VisualizationKind,
    ) -> Result<ImageArtifact, ApiError>;

    /// `POST /api/chatbot`; returns the assistant's reply text.
    async fn chat(&self, message: &str) -> Result<String, ApiError>;
}

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Connect,
    Decode,
    InvalidRequest,
    RateLimit,
    ServerError,
    Unknown,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit,
            400 | 404 | 413 | 415 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}

/// Failure of exactly one request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The service could not be reached or its response could not be parsed.
    #[error("transport failure ({kind:?}): {message}")]
    Transport { kind: ErrorKind, message: String },

    /// The service answered with a non-success status.
    #[error("service failure (status {status}): {}", .detail.as_deref().unwrap_or("no detail"))]
    Service { status: u16, detail: Option<String> },
}

impl ApiError {
    pub fn transport(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::transport(ErrorKind::Decode, message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { kind, .. } => *kind,
            Self::Service { status, .. } => ErrorKind::from_status(*status),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

// ============================================================
// Offline stub
// ============================================================

/// 1x1 transparent PNG.
pub const PLACEHOLDER_PNG: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Backend that never touches the network.
///
/// Counts lines, words, `<Media omitted>` markers and `http` links of the export,
/// serves a placeholder image for every chart and echoes chat input.
pub struct StubBackend;

#[async_trait]
impl AnalysisBackend for StubBackend {
    async fn analyze(&self, export: ChatExport) -> Result<AnalysisReport, ApiError> {
        let text = String::from_utf8(export.bytes)
            .map_err(|e| ApiError::decode(format!("export is not utf-8: {e}")))?;
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return Err(ApiError::Service {
                status: 400,
                detail: Some("Empty file uploaded.".to_string()),
            });
        }

        Ok(AnalysisReport {
            total_messages: lines.len() as u64,
            words: lines.iter().map(|l| l.split_whitespace().count() as u64).sum(),
            num_media: lines.iter().filter(|l| l.contains("<Media omitted>")).count() as u64,
            num_links: lines
                .iter()
                .map(|l| l.matches("http://").count() + l.matches("https://").count())
                .sum::<usize>() as u64,
            sentiment_distribution: Default::default(),
            topic_plot: Some(ImageArtifact::new(PLACEHOLDER_PNG)),
            sentiment_plot: Some(ImageArtifact::new(PLACEHOLDER_PNG)),
        })
    }

    async fn fetch_visualization(
        &self,
        _kind: VisualizationKind,
    ) -> Result<ImageArtifact, ApiError> {
        Ok(ImageArtifact::new(PLACEHOLDER_PNG))
    }

    async fn chat(&self, message: &str) -> Result<String, ApiError> {
        Ok(format!("[stub] {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_classification() {
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(400), ErrorKind::InvalidRequest);
        assert_eq!(ErrorKind::from_status(422), ErrorKind::InvalidRequest);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(302), ErrorKind::Unknown);
    }

    #[test]
    fn api_error_kind_and_display() {
        let err = ApiError::Service {
            status: 500,
            detail: Some("An error occurred while processing the file.".into()),
        };
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert!(!err.is_transport());
        let text = err.to_string();
        assert!(text.contains("500"));
        assert!(text.contains("processing the file"));

        let err = ApiError::Service {
            status: 404,
            detail: None,
        };
        assert!(err.to_string().contains("no detail"));

        let err = ApiError::transport(ErrorKind::Connect, "connection refused");
        assert_eq!(err.kind(), ErrorKind::Connect);
        assert!(err.is_transport());
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn stub_backend_counts_export() {
        let export = ChatExport::new(
            "chat.txt",
            "12/01/24, 10:00 - a: hello there\n\n12/01/24, 10:01 - b: <Media omitted>\n12/01/24, 10:02 - a: see https://example.com\n",
        );
        let report = StubBackend.analyze(export).await.unwrap();
        assert_eq!(report.total_messages, 3);
        assert_eq!(report.num_media, 1);
        assert_eq!(report.num_links, 1);
        assert_eq!(report.words, 6 + 6 + 6);
        assert!(report.topic_plot.is_some());
    }

    #[tokio::test]
    async fn stub_backend_rejects_empty_export() {
        let err = StubBackend
            .analyze(ChatExport::new("chat.txt", "\n \n"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn stub_backend_serves_decodable_placeholder() {
        let image = StubBackend
            .fetch_visualization(VisualizationKind::DailyTimeline)
            .await
            .unwrap();
        let bytes = image.decode().unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[tokio::test]
    async fn stub_backend_echoes_chat() {
        assert_eq!(StubBackend.chat("ping").await.unwrap(), "[stub] ping");
    }
}
