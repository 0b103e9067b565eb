use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chatlens_schema::BusMessage;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Topic {
    JobStatusChanged,
    VisualizationsReset,
    VisualizationSettled,
    ChatTurnAppended,
    ChatAwaitingChanged,
}

impl Topic {
    pub fn from_message(msg: &BusMessage) -> Self {
        match msg {
            BusMessage::JobStatusChanged { .. } => Topic::JobStatusChanged,
            BusMessage::VisualizationsReset { .. } => Topic::VisualizationsReset,
            BusMessage::VisualizationSettled { .. } => Topic::VisualizationSettled,
            BusMessage::ChatTurnAppended { .. } => Topic::ChatTurnAppended,
            BusMessage::ChatAwaitingChanged { .. } => Topic::ChatAwaitingChanged,
        }
    }
}

type Subscriber = mpsc::Sender<BusMessage>;
type Subscribers = Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>;

/// In-process fan-out of state-change events to observers.
///
/// Publishing never blocks: a subscriber whose queue is full misses the event.
/// State snapshots stay authoritative; events only say when to re-read them.
pub struct EventBus {
    subscribers: Subscribers,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(self.capacity.max(1));
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.entry(topic).or_default().push(tx);
        rx
    }

    pub fn publish(&self, msg: BusMessage) {
        publish_to(&self.subscribers, msg);
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[derive(Clone)]
pub struct BusPublisher {
    subscribers: Subscribers,
}

impl BusPublisher {
    pub fn publish(&self, msg: BusMessage) {
        publish_to(&self.subscribers, msg);
    }
}

fn publish_to(subscribers: &Subscribers, msg: BusMessage) {
    let topic = Topic::from_message(&msg);
    let mut subs = subscribers
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(senders) = subs.get_mut(&topic) {
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            if tx.try_send(msg.clone()).is_err() {
                tracing::trace!(?topic, "subscriber queue full, event dropped");
            }
        }
    }
}
