use std::sync::Arc;

use chatlens_bus::EventBus;
use chatlens_provider::{http::HttpBackend, AnalysisBackend};
use chatlens_schema::{AnalysisJob, ChatExport, JobStatus};

use crate::{
    AggregatorRun, AnalysisJobController, ChatSession, ClientConfig, CoreError, ResourceAggregator,
};

/// Result of one [`AnalyzerApp::analyze`] call.
pub struct AnalysisOutcome {
    pub job: AnalysisJob,
    /// Present only when the job succeeded and chart fetching was started.
    pub visualizations: Option<AggregatorRun>,
}

/// One analysis job, one set of charts and one chat session over a shared
/// backend and event bus.
pub struct AnalyzerApp {
    bus: EventBus,
    analysis: AnalysisJobController,
    visualizations: ResourceAggregator,
    chat: ChatSession,
}

impl AnalyzerApp {
    pub fn new(backend: Arc<dyn AnalysisBackend>, config: &ClientConfig) -> Self {
        let bus = EventBus::new(config.event_capacity.max(1));
        let analysis = AnalysisJobController::new(backend.clone(), bus.publisher())
            .with_accepted_extensions(config.accepted_extensions.clone());
        let visualizations = ResourceAggregator::new(backend.clone(), bus.publisher());
        let chat = ChatSession::new(backend, bus.publisher());
        Self {
            bus,
            analysis,
            visualizations,
            chat,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let backend = HttpBackend::with_timeout(config.base_url.clone(), config.request_timeout());
        Self::new(Arc::new(backend), config)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn analysis(&self) -> &AnalysisJobController {
        &self.analysis
    }

    pub fn visualizations(&self) -> &ResourceAggregator {
        &self.visualizations
    }

    pub fn chat(&self) -> &ChatSession {
        &self.chat
    }

    /// Submits the export and waits for it to settle. Chart fetching starts
    /// only after a successful analysis; the returned run can be awaited or dropped.
    pub async fn analyze(&self, file: Option<ChatExport>) -> Result<AnalysisOutcome, CoreError> {
        let handle = self.analysis.submit(file)?;
        let job = match handle.await {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!("analysis task did not complete: {err}");
                self.analysis.snapshot()
            }
        };

        let visualizations = if job.status == JobStatus::Succeeded {
            Some(self.visualizations.start())
        } else {
            None
        };

        Ok(AnalysisOutcome {
            job,
            visualizations,
        })
    }
}
