use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================
// Analysis job
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Submitting,
    Succeeded,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Idle => write!(f, "idle"),
            JobStatus::Submitting => write!(f, "submitting"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregate metrics returned by `POST /api/analyze`.
///
/// Field names follow the wire format. Only the four counts are required;
/// the sentiment distribution and both plots default when the service omits them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisReport {
    pub total_messages: u64,
    pub words: u64,
    pub num_media: u64,
    pub num_links: u64,
    #[serde(default)]
    pub sentiment_distribution: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_plot: Option<ImageArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_plot: Option<ImageArtifact>,
}

/// Read-only view of the single analysis job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisJob {
    pub status: JobStatus,
    #[serde(default)]
    pub payload: Option<AnalysisReport>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Correlates log lines and bus events of one submission.
    #[serde(default)]
    pub trace_id: Option<Uuid>,
}

impl AnalysisJob {
    pub fn is_in_flight(&self) -> bool {
        self.status == JobStatus::Submitting
    }
}

/// A chat export handed to the analysis service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatExport {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ChatExport {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    /// Lower-cased text after the last dot, if any. A bare `.txt` counts as `txt`.
    pub fn extension(&self) -> Option<String> {
        let (_, ext) = self.file_name.rsplit_once('.')?;
        if ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

// ============================================================
// Images
// ============================================================

/// Base64-encoded PNG as delivered by the service, kept encoded for inline embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ImageArtifact(String);

impl ImageArtifact {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_base64(&self) -> &str {
        &self.0
    }

    pub fn data_uri(&self) -> String {
        format!("data:image/png;base64,{}", self.0)
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.0.trim())
    }
}

// ============================================================
// Visualizations
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationKind {
    MonthlyTimeline,
    WeeklyActivityMap,
    DailyTimeline,
}

impl VisualizationKind {
    pub const ALL: [VisualizationKind; 3] = [
        VisualizationKind::MonthlyTimeline,
        VisualizationKind::WeeklyActivityMap,
        VisualizationKind::DailyTimeline,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            VisualizationKind::MonthlyTimeline => "/api/monthly-timeline",
            VisualizationKind::WeeklyActivityMap => "/api/weekly-activity-map",
            VisualizationKind::DailyTimeline => "/api/daily-timeline",
        }
    }

    /// JSON field carrying the image in the response body.
    pub fn response_field(&self) -> &'static str {
        match self {
            VisualizationKind::MonthlyTimeline => "monthly_timeline",
            VisualizationKind::WeeklyActivityMap => "weekly_activity_map",
            VisualizationKind::DailyTimeline => "daily_timeline",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            VisualizationKind::MonthlyTimeline => "Monthly Timeline",
            VisualizationKind::WeeklyActivityMap => "Weekly Activity Map",
            VisualizationKind::DailyTimeline => "Daily Timeline",
        }
    }
}

impl fmt::Display for VisualizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.response_field())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisualizationResource {
    pub kind: VisualizationKind,
    pub status: ResourceStatus,
    #[serde(default)]
    pub payload: Option<ImageArtifact>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl VisualizationResource {
    pub fn pending(kind: VisualizationKind) -> Self {
        Self {
            kind,
            status: ResourceStatus::Pending,
            payload: None,
            error_message: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status != ResourceStatus::Pending
    }
}

/// The three resources of one aggregator run, in `VisualizationKind::ALL` order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisualizationSet {
    /// Zero until the first run starts.
    pub generation: u64,
    pub resources: Vec<VisualizationResource>,
}

impl VisualizationSet {
    pub fn pending(generation: u64) -> Self {
        Self {
            generation,
            resources: VisualizationKind::ALL
                .iter()
                .map(|kind| VisualizationResource::pending(*kind))
                .collect(),
        }
    }

    pub fn get(&self, kind: VisualizationKind) -> Option<&VisualizationResource> {
        self.resources.iter().find(|r| r.kind == kind)
    }

    pub fn get_mut(&mut self, kind: VisualizationKind) -> Option<&mut VisualizationResource> {
        self.resources.iter_mut().find(|r| r.kind == kind)
    }

    pub fn count(&self, status: ResourceStatus) -> usize {
        self.resources.iter().filter(|r| r.status == status).count()
    }

    pub fn is_settled(&self) -> bool {
        !self.resources.is_empty() && self.resources.iter().all(VisualizationResource::is_settled)
    }
}

// ============================================================
// Chat
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Sent,
    AwaitingReply,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub sequence: u64,
    pub role: ChatRole,
    pub content: String,
    pub status: TurnStatus,
    pub at: DateTime<Utc>,
}

/// Read-only view of the conversation log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTranscript {
    pub turns: Vec<ChatTurn>,
    /// Sequence of the user turn whose reply is outstanding.
    #[serde(default)]
    pub awaiting: Option<u64>,
}

impl ChatTranscript {
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ChatTurn> {
        self.turns.last()
    }

    pub fn is_awaiting(&self) -> bool {
        self.awaiting.is_some()
    }
}

// ============================================================
// Bus
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    JobStatusChanged {
        trace_id: Uuid,
        status: JobStatus,
    },
    VisualizationsReset {
        generation: u64,
    },
    VisualizationSettled {
        generation: u64,
        kind: VisualizationKind,
        status: ResourceStatus,
    },
    ChatTurnAppended {
        sequence: u64,
        role: ChatRole,
        status: TurnStatus,
    },
    ChatAwaitingChanged {
        awaiting: Option<u64>,
    },
}
