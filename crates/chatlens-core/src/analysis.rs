use std::sync::{Arc, Mutex};

use chatlens_bus::BusPublisher;
use chatlens_provider::{AnalysisBackend, ApiError, ErrorKind};
use chatlens_schema::{AnalysisJob, AnalysisReport, BusMessage, ChatExport, JobStatus};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{lock, CoreError, SettleOnDrop};

pub const ANALYSIS_ERROR_MESSAGE: &str =
    "An error occurred while analyzing the chat. Please try again.";

/// Owns the single analysis job. At most one submission is in flight; no retries.
#[derive(Clone)]
pub struct AnalysisJobController {
    backend: Arc<dyn AnalysisBackend>,
    state: Arc<Mutex<AnalysisJob>>,
    publisher: BusPublisher,
    accepted_extensions: Arc<Vec<String>>,
}

impl AnalysisJobController {
    pub fn new(backend: Arc<dyn AnalysisBackend>, publisher: BusPublisher) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(AnalysisJob::default())),
            publisher,
            accepted_extensions: Arc::new(vec!["txt".to_string(), "csv".to_string()]),
        }
    }

    /// Extensions are compared lower-cased without the dot. An empty list accepts any file.
    pub fn with_accepted_extensions(mut self, extensions: Vec<String>) -> Self {
        self.accepted_extensions = Arc::new(extensions);
        self
    }

    pub fn snapshot(&self) -> AnalysisJob {
        lock(&self.state).clone()
    }

    /// Accepts the file and dispatches one request, or rejects without touching state.
    ///
    /// On acceptance the job is already `Submitting` when this returns. The
    /// handle resolves to the settled snapshot.
    pub fn submit(&self, file: Option<ChatExport>) -> Result<JoinHandle<AnalysisJob>, CoreError> {
        let export = self.validate(file)?;
        let trace_id = Uuid::new_v4();

        {
            let mut job = lock(&self.state);
            if job.is_in_flight() {
                return Err(CoreError::Busy("analysis job"));
            }
            job.status = JobStatus::Submitting;
            job.error_message = None;
            job.trace_id = Some(trace_id);
        }

        tracing::info!(
            %trace_id,
            file_name = %export.file_name,
            bytes = export.bytes.len(),
            "analysis submitted"
        );
        self.publisher.publish(BusMessage::JobStatusChanged {
            trace_id,
            status: JobStatus::Submitting,
        });

        let unwinding = self.clone();
        let guard = SettleOnDrop::new(move || {
            unwinding.settle(
                trace_id,
                Err(ApiError::transport(
                    ErrorKind::Unknown,
                    "analysis task ended before the request settled",
                )),
            );
        });
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let result = this.backend.analyze(export).await;
            guard.disarm();
            this.settle(trace_id, result)
        }))
    }

    fn validate(&self, file: Option<ChatExport>) -> Result<ChatExport, CoreError> {
        let Some(export) = file else {
            return Err(CoreError::invalid_input("no file attached"));
        };
        if export.file_name.trim().is_empty() {
            return Err(CoreError::invalid_input("file has no name"));
        }
        if self.accepted_extensions.is_empty() {
            return Ok(export);
        }
        match export.extension() {
            Some(ext) if self.accepted_extensions.contains(&ext) => Ok(export),
            _ => Err(CoreError::invalid_input(format!(
                "unsupported file type: {} (expected .{})",
                export.file_name,
                self.accepted_extensions.join(", .")
            ))),
        }
    }

    fn settle(&self, trace_id: Uuid, result: Result<AnalysisReport, ApiError>) -> AnalysisJob {
        let (status, snapshot) = {
            let mut job = lock(&self.state);
            if job.trace_id != Some(trace_id) || !job.is_in_flight() {
                tracing::debug!(%trace_id, "discarding settlement of superseded analysis job");
                return job.clone();
            }

            match result {
                Ok(report) => {
                    tracing::info!(
                        %trace_id,
                        total_messages = report.total_messages,
                        words = report.words,
                        "analysis succeeded"
                    );
                    job.payload = Some(report);
                    job.status = JobStatus::Succeeded;
                }
                Err(err) => {
                    tracing::warn!(%trace_id, kind = ?err.kind(), "analysis failed: {err}");
                    job.payload = None;
                    job.error_message = Some(ANALYSIS_ERROR_MESSAGE.to_string());
                    job.status = JobStatus::Failed;
                }
            }
            (job.status, job.clone())
        };

        self.publisher
            .publish(BusMessage::JobStatusChanged { trace_id, status });
        snapshot
    }
}
