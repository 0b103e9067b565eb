use std::sync::{Arc, Mutex};

use chatlens_bus::BusPublisher;
use chatlens_provider::{AnalysisBackend, ApiError, ErrorKind};
use chatlens_schema::{BusMessage, ChatRole, ChatTranscript, ChatTurn, TurnStatus};
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::{lock, CoreError, SettleOnDrop};

pub const CHAT_FALLBACK_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug, Default)]
struct ChatState {
    transcript: ChatTranscript,
    next_sequence: u64,
}

impl ChatState {
    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn turn_mut(&mut self, sequence: u64) -> Option<&mut ChatTurn> {
        self.transcript
            .turns
            .iter_mut()
            .find(|turn| turn.sequence == sequence)
    }
}

/// Ordered conversation with the assistant.
///
/// Dispatch is serialized: while a reply is outstanding the user turn that
/// asked for it is `AwaitingReply` and further sends are rejected. Once the
/// reply settles the user turn goes back to `Sent` and exactly one assistant
/// turn is appended after it.
#[derive(Clone)]
pub struct ChatSession {
    backend: Arc<dyn AnalysisBackend>,
    state: Arc<Mutex<ChatState>>,
    publisher: BusPublisher,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn AnalysisBackend>, publisher: BusPublisher) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(ChatState::default())),
            publisher,
        }
    }

    pub fn transcript(&self) -> ChatTranscript {
        lock(&self.state).transcript.clone()
    }

    pub fn is_awaiting(&self) -> bool {
        lock(&self.state).transcript.is_awaiting()
    }

    /// Appends the user turn and dispatches one assistant request.
    ///
    /// The handle resolves to the appended assistant turn, or `None` if the
    /// settlement no longer matched the awaited user turn.
    pub fn send_message(&self, text: &str) -> Result<JoinHandle<Option<ChatTurn>>, CoreError> {
        if text.trim().is_empty() {
            return Err(CoreError::invalid_input("message is empty"));
        }

        // The user turn and the awaiting marker change under one lock.
        let sequence = {
            let mut state = lock(&self.state);
            if state.transcript.is_awaiting() {
                return Err(CoreError::Busy("chat reply"));
            }
            let sequence = state.next_sequence();
            state.transcript.turns.push(ChatTurn {
                sequence,
                role: ChatRole::User,
                content: text.to_string(),
                status: TurnStatus::AwaitingReply,
                at: Utc::now(),
            });
            state.transcript.awaiting = Some(sequence);
            sequence
        };
        self.publisher.publish(BusMessage::ChatTurnAppended {
            sequence,
            role: ChatRole::User,
            status: TurnStatus::AwaitingReply,
        });
        self.publisher.publish(BusMessage::ChatAwaitingChanged {
            awaiting: Some(sequence),
        });
        tracing::debug!(sequence, "chat message dispatched");

        let unwinding = self.clone();
        let guard = SettleOnDrop::new(move || {
            unwinding.settle(
                sequence,
                Err(ApiError::transport(
                    ErrorKind::Unknown,
                    "chat task ended before the reply settled",
                )),
            );
        });
        let this = self.clone();
        let message = text.to_string();
        Ok(tokio::spawn(async move {
            let reply = this.backend.chat(&message).await;
            guard.disarm();
            this.settle(sequence, reply)
        }))
    }

    fn settle(&self, user_sequence: u64, reply: Result<String, ApiError>) -> Option<ChatTurn> {
        let turn = {
            let mut state = lock(&self.state);
            if state.transcript.awaiting != Some(user_sequence) {
                tracing::debug!(
                    user_sequence,
                    awaiting = ?state.transcript.awaiting,
                    "discarding chat reply for a turn that is not awaited"
                );
                return None;
            }

            let (content, status) = match reply {
                Ok(text) => (text, TurnStatus::Completed),
                Err(err) => {
                    tracing::warn!(
                        user_sequence,
                        error_kind = ?err.kind(),
                        "chat request failed: {err}"
                    );
                    (CHAT_FALLBACK_MESSAGE.to_string(), TurnStatus::Failed)
                }
            };

            let sequence = state.next_sequence();
            let turn = ChatTurn {
                sequence,
                role: ChatRole::Assistant,
                content,
                status,
                at: Utc::now(),
            };
            state.transcript.turns.push(turn.clone());
            if let Some(user_turn) = state.turn_mut(user_sequence) {
                user_turn.status = TurnStatus::Sent;
            }
            state.transcript.awaiting = None;
            turn
        };

        tracing::info!(sequence = turn.sequence, status = ?turn.status, "assistant turn appended");
        self.publisher.publish(BusMessage::ChatTurnAppended {
            sequence: turn.sequence,
            role: ChatRole::Assistant,
            status: turn.status,
        });
        self.publisher
            .publish(BusMessage::ChatAwaitingChanged { awaiting: None });
        Some(turn)
    }
}
