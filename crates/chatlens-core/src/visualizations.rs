use std::sync::{Arc, Mutex};

use chatlens_bus::BusPublisher;
use chatlens_provider::{AnalysisBackend, ApiError, ErrorKind};
use chatlens_schema::{
    BusMessage, ImageArtifact, ResourceStatus, VisualizationKind, VisualizationSet,
};
use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::lock;

pub const VISUALIZATION_ERROR_MESSAGE: &str = "An error occurred while fetching graphs.";

/// Fetches the three supplementary charts concurrently.
///
/// Every resource settles on its own. A restart bumps the generation; responses
/// tagged with an older generation are dropped, in-flight requests are not cancelled.
#[derive(Clone)]
pub struct ResourceAggregator {
    backend: Arc<dyn AnalysisBackend>,
    state: Arc<Mutex<VisualizationSet>>,
    publisher: BusPublisher,
}

impl ResourceAggregator {
    pub fn new(backend: Arc<dyn AnalysisBackend>, publisher: BusPublisher) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(VisualizationSet::default())),
            publisher,
        }
    }

    pub fn snapshot(&self) -> VisualizationSet {
        lock(&self.state).clone()
    }

    pub fn start(&self) -> AggregatorRun {
        let generation = {
            let mut set = lock(&self.state);
            let generation = set.generation + 1;
            *set = VisualizationSet::pending(generation);
            generation
        };

        tracing::debug!(generation, "visualization fetch started");
        self.publisher
            .publish(BusMessage::VisualizationsReset { generation });

        let tasks = VisualizationKind::ALL
            .iter()
            .map(|&kind| {
                let this = self.clone();
                let handle = tokio::spawn(async move {
                    let result = this.backend.fetch_visualization(kind).await;
                    this.settle(generation, kind, result);
                });
                (kind, handle)
            })
            .collect();

        AggregatorRun {
            generation,
            tasks,
            aggregator: self.clone(),
        }
    }

    /// Applies one settlement. Returns false when it was stale or the resource had already settled.
    fn settle(
        &self,
        generation: u64,
        kind: VisualizationKind,
        result: Result<ImageArtifact, ApiError>,
    ) -> bool {
        let status = {
            let mut set = lock(&self.state);
            if set.generation != generation {
                tracing::debug!(
                    %kind,
                    generation,
                    current = set.generation,
                    "discarding stale visualization response"
                );
                return false;
            }
            let Some(resource) = set.get_mut(kind) else {
                return false;
            };
            if resource.is_settled() {
                return false;
            }

            match result {
                Ok(image) => {
                    resource.payload = Some(image);
                    resource.status = ResourceStatus::Loaded;
                }
                Err(err) => {
                    tracing::warn!(
                        %kind,
                        generation,
                        error_kind = ?err.kind(),
                        "visualization fetch failed: {err}"
                    );
                    resource.error_message = Some(VISUALIZATION_ERROR_MESSAGE.to_string());
                    resource.status = ResourceStatus::Failed;
                }
            }
            resource.status
        };

        tracing::info!(%kind, generation, ?status, "visualization settled");
        self.publisher.publish(BusMessage::VisualizationSettled {
            generation,
            kind,
            status,
        });
        true
    }
}

/// Bookkeeping handle for one `start()`.
pub struct AggregatorRun {
    generation: u64,
    tasks: Vec<(VisualizationKind, JoinHandle<()>)>,
    aggregator: ResourceAggregator,
}

impl AggregatorRun {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Waits until every request of this run has settled, then returns the
    /// current set. Once superseded, the set belongs to the newer generation.
    pub async fn settled(self) -> VisualizationSet {
        let (kinds, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        for (kind, joined) in kinds.into_iter().zip(join_all(handles).await) {
            if let Err(err) = joined {
                self.aggregator.settle(
                    self.generation,
                    kind,
                    Err(ApiError::transport(
                        ErrorKind::Unknown,
                        format!("fetch task aborted: {err}"),
                    )),
                );
            }
        }
        self.aggregator.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatlens_bus::{EventBus, Topic};
    use chatlens_schema::{AnalysisReport, ChatExport};
    use std::collections::HashMap;
    use tokio::sync::oneshot;

    type Reply = Result<ImageArtifact, ApiError>;

    /// Each fetch waits for a reply pushed by the test, per kind, in request order.
    #[derive(Default)]
    struct ScriptedBackend {
        pending: Mutex<HashMap<VisualizationKind, Vec<oneshot::Sender<Reply>>>>,
        requested: tokio::sync::Notify,
    }

    impl ScriptedBackend {
        async fn wait_for_requests(&self, kind: VisualizationKind, count: usize) {
            loop {
                let notified = self.requested.notified();
                if self.pending.lock().unwrap().get(&kind).map_or(0, Vec::len) >= count {
                    return;
                }
                notified.await;
            }
        }

        /// Resolves the `index`-th request issued for `kind`.
        fn reply(&self, kind: VisualizationKind, index: usize, reply: Reply) {
            let tx = {
                let mut pending = self.pending.lock().unwrap();
                let senders = pending.get_mut(&kind).unwrap();
                std::mem::replace(&mut senders[index], oneshot::channel().0)
            };
            let _ = tx.send(reply);
        }
    }

    #[async_trait]
    impl AnalysisBackend for ScriptedBackend {
        async fn analyze(&self, _export: ChatExport) -> Result<AnalysisReport, ApiError> {
            unreachable!("not used by the aggregator")
        }

        async fn fetch_visualization(
            &self,
            kind: VisualizationKind,
        ) -> Result<ImageArtifact, ApiError> {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().entry(kind).or_default().push(tx);
            self.requested.notify_waiters();
            rx.await
                .unwrap_or_else(|_| Err(ApiError::transport(ErrorKind::Unknown, "dropped")))
        }

        async fn chat(&self, _message: &str) -> Result<String, ApiError> {
            unreachable!("not used by the aggregator")
        }
    }

    fn image(tag: &str) -> Reply {
        Ok(ImageArtifact::new(tag))
    }

    fn server_error() -> Reply {
        Err(ApiError::Service {
            status: 500,
            detail: None,
        })
    }

    fn scripted() -> (ResourceAggregator, Arc<ScriptedBackend>, EventBus) {
        let backend = Arc::new(ScriptedBackend::default());
        let bus = EventBus::new(16);
        let aggregator = ResourceAggregator::new(backend.clone(), bus.publisher());
        (aggregator, backend, bus)
    }

    async fn wait_all(backend: &ScriptedBackend, count: usize) {
        for kind in VisualizationKind::ALL {
            backend.wait_for_requests(kind, count).await;
        }
    }

    #[test]
    fn snapshot_before_start_is_empty() {
        let bus = EventBus::new(4);
        let aggregator =
            ResourceAggregator::new(Arc::new(ScriptedBackend::default()), bus.publisher());
        let set = aggregator.snapshot();
        assert_eq!(set.generation, 0);
        assert!(set.resources.is_empty());
    }

    #[tokio::test]
    async fn start_issues_three_requests_without_waiting() {
        let (aggregator, backend, _bus) = scripted();
        let run = aggregator.start();
        assert_eq!(run.generation(), 1);
        assert_eq!(aggregator.snapshot().count(ResourceStatus::Pending), 3);

        // All three are outstanding at once; none waits for a sibling.
        wait_all(&backend, 1).await;

        for kind in VisualizationKind::ALL {
            backend.reply(kind, 0, image(kind.response_field()));
        }
        let set = run.settled().await;
        assert_eq!(set.count(ResourceStatus::Loaded), 3);
        assert_eq!(
            set.get(VisualizationKind::DailyTimeline)
                .unwrap()
                .payload
                .as_ref()
                .unwrap()
                .as_base64(),
            "daily_timeline"
        );
    }

    #[tokio::test]
    async fn settlement_order_does_not_matter() {
        let (aggregator, backend, _bus) = scripted();
        let run = aggregator.start();
        wait_all(&backend, 1).await;

        backend.reply(VisualizationKind::DailyTimeline, 0, image("d"));
        backend.reply(VisualizationKind::MonthlyTimeline, 0, server_error());
        tokio::task::yield_now().await;
        backend.reply(VisualizationKind::WeeklyActivityMap, 0, image("w"));

        let set = run.settled().await;
        assert_eq!(
            set.get(VisualizationKind::MonthlyTimeline).unwrap().status,
            ResourceStatus::Failed
        );
        assert_eq!(
            set.get(VisualizationKind::WeeklyActivityMap).unwrap().status,
            ResourceStatus::Loaded
        );
        assert_eq!(
            set.get(VisualizationKind::DailyTimeline).unwrap().status,
            ResourceStatus::Loaded
        );
    }

    #[tokio::test]
    async fn every_failure_subset_leaves_siblings_loaded() {
        for mask in 0u8..8 {
            let (aggregator, backend, _bus) = scripted();
            let run = aggregator.start();
            wait_all(&backend, 1).await;

            for (i, kind) in VisualizationKind::ALL.iter().enumerate() {
                let reply = if mask & (1 << i) != 0 { server_error() } else { image("ok") };
                backend.reply(*kind, 0, reply);
            }

            let set = run.settled().await;
            for (i, kind) in VisualizationKind::ALL.iter().enumerate() {
                let resource = set.get(*kind).unwrap();
                if mask & (1 << i) != 0 {
                    assert_eq!(resource.status, ResourceStatus::Failed, "mask {mask:03b} {kind}");
                    assert_eq!(
                        resource.error_message.as_deref(),
                        Some(VISUALIZATION_ERROR_MESSAGE)
                    );
                    assert!(resource.payload.is_none());
                } else {
                    assert_eq!(resource.status, ResourceStatus::Loaded, "mask {mask:03b} {kind}");
                    assert!(resource.error_message.is_none());
                }
            }
        }
    }

    #[tokio::test]
    async fn mixed_state_is_observable_before_all_settle() {
        let (aggregator, backend, _bus) = scripted();
        let run = aggregator.start();
        wait_all(&backend, 1).await;

        backend.reply(VisualizationKind::WeeklyActivityMap, 0, server_error());
        // Let the failed fetch task apply its settlement.
        while aggregator.snapshot().count(ResourceStatus::Failed) == 0 {
            tokio::task::yield_now().await;
        }
        let partial = aggregator.snapshot();
        assert_eq!(partial.count(ResourceStatus::Pending), 2);
        assert!(!partial.is_settled());

        backend.reply(VisualizationKind::MonthlyTimeline, 0, image("m"));
        backend.reply(VisualizationKind::DailyTimeline, 0, image("d"));
        let set = run.settled().await;
        assert!(set.is_settled());
        assert_eq!(set.count(ResourceStatus::Failed), 1);
        assert_eq!(set.count(ResourceStatus::Loaded), 2);
    }

    #[tokio::test]
    async fn stale_generation_response_is_discarded() {
        let (aggregator, backend, _bus) = scripted();
        let first = aggregator.start();
        wait_all(&backend, 1).await;

        let second = aggregator.start();
        assert_eq!(second.generation(), 2);
        wait_all(&backend, 2).await;

        // The new generation settles first, then the slow old responses arrive.
        for kind in VisualizationKind::ALL {
            backend.reply(kind, 1, image("fresh"));
        }
        let set = second.settled().await;
        assert_eq!(set.count(ResourceStatus::Loaded), 3);

        for kind in VisualizationKind::ALL {
            backend.reply(kind, 0, server_error());
        }
        let after = first.settled().await;
        assert_eq!(after.generation, 2);
        for resource in &after.resources {
            assert_eq!(resource.status, ResourceStatus::Loaded);
            assert_eq!(resource.payload.as_ref().unwrap().as_base64(), "fresh");
        }
    }

    #[tokio::test]
    async fn restart_resets_entries_to_pending() {
        let (aggregator, backend, _bus) = scripted();
        let first = aggregator.start();
        wait_all(&backend, 1).await;
        for kind in VisualizationKind::ALL {
            backend.reply(kind, 0, image("old"));
        }
        first.settled().await;

        let _second = aggregator.start();
        let set = aggregator.snapshot();
        assert_eq!(set.generation, 2);
        assert_eq!(set.count(ResourceStatus::Pending), 3);
        assert!(set.resources.iter().all(|r| r.payload.is_none()));
    }

    #[tokio::test]
    async fn settled_resource_never_reverts() {
        let (aggregator, _backend, _bus) = scripted();
        let _run = aggregator.start();

        assert!(aggregator.settle(1, VisualizationKind::MonthlyTimeline, image("a")));
        assert!(!aggregator.settle(1, VisualizationKind::MonthlyTimeline, server_error()));
        assert!(!aggregator.settle(0, VisualizationKind::DailyTimeline, image("stale")));

        let set = aggregator.snapshot();
        assert_eq!(
            set.get(VisualizationKind::MonthlyTimeline).unwrap().status,
            ResourceStatus::Loaded
        );
        assert_eq!(
            set.get(VisualizationKind::DailyTimeline).unwrap().status,
            ResourceStatus::Pending
        );
    }

    #[tokio::test]
    async fn publishes_reset_and_per_resource_events() {
        let (aggregator, backend, bus) = scripted();
        let mut resets = bus.subscribe(Topic::VisualizationsReset);
        let mut settled = bus.subscribe(Topic::VisualizationSettled);

        let run = aggregator.start();
        wait_all(&backend, 1).await;
        backend.reply(VisualizationKind::WeeklyActivityMap, 0, server_error());
        backend.reply(VisualizationKind::MonthlyTimeline, 0, image("m"));
        backend.reply(VisualizationKind::DailyTimeline, 0, image("d"));
        run.settled().await;

        assert!(matches!(
            resets.recv().await.unwrap(),
            BusMessage::VisualizationsReset { generation: 1 }
        ));
        let mut failed = 0;
        for _ in 0..3 {
            if let BusMessage::VisualizationSettled { status, generation, .. } =
                settled.recv().await.unwrap()
            {
                assert_eq!(generation, 1);
                if status == ResourceStatus::Failed {
                    failed += 1;
                }
            }
        }
        assert_eq!(failed, 1);
    }
}
