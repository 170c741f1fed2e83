use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::error::{RemoteError, RemoteResult, ScriptExhaustedSnafu};
use super::ids::{ConversationId, DocumentId, MessageId};
use super::service::{
    BoxFuture, ConversationService, FeedEvent, FeedWorker, StreamHandle, make_stream_feed,
};
use super::wire::{
    ConversationCreated, EditConfirmed, EditRequest, SendConfirmed, SendRequest, StreamFrame,
    WireMessage, WireRole,
};

const SEED_ROOT_CREATED_AT: u64 = 1_700_000_000;

/// Deterministic in-memory conversation service for tests and QA scenarios.
///
/// Request outcomes are consumed in FIFO order; streaming feeds replay the
/// frames scripted for their assistant message. Requests are recorded so
/// callers can assert on what actually went over the boundary.
#[derive(Default)]
pub struct ScriptedConversationService {
    state: Mutex<ScriptState>,
}

#[derive(Default)]
struct ScriptState {
    conversation: Option<ConversationCreated>,
    tree: Vec<WireMessage>,
    send_outcomes: VecDeque<Result<SendConfirmed, String>>,
    edit_outcomes: VecDeque<Result<EditConfirmed, String>>,
    frames: HashMap<MessageId, Vec<StreamFrame>>,
    send_requests: Vec<SendRequest>,
    edit_requests: Vec<EditRequest>,
}

impl ScriptedConversationService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seeds a conversation with a system root and returns its identities.
    pub fn seed_conversation(&self) -> ConversationCreated {
        let created = ConversationCreated {
            conversation_id: ConversationId::new_v7(),
            root_message_id: MessageId::new_v7(),
        };
        let root = WireMessage::new(
            created.root_message_id,
            WireRole::System,
            "",
            SEED_ROOT_CREATED_AT,
        );

        let mut state = self.state();
        state.conversation = Some(created);
        state.tree = vec![root];
        created
    }

    /// Replaces the flat history served by `fetch_tree`.
    pub fn set_tree(&self, messages: Vec<WireMessage>) {
        self.state().tree = messages;
    }

    pub fn queue_send_success(&self) -> SendConfirmed {
        let confirmed = SendConfirmed {
            user_message_id: MessageId::new_v7(),
            assistant_message_id: MessageId::new_v7(),
        };
        self.state().send_outcomes.push_back(Ok(confirmed));
        confirmed
    }

    pub fn queue_send_failure(&self, message: impl Into<String>) {
        self.state().send_outcomes.push_back(Err(message.into()));
    }

    pub fn queue_edit_success(&self) -> EditConfirmed {
        let confirmed = EditConfirmed {
            edited_message_id: MessageId::new_v7(),
            assistant_message_id: MessageId::new_v7(),
        };
        self.state().edit_outcomes.push_back(Ok(confirmed));
        confirmed
    }

    pub fn queue_edit_failure(&self, message: impl Into<String>) {
        self.state().edit_outcomes.push_back(Err(message.into()));
    }

    /// Scripts the feed frames replayed for one assistant message.
    pub fn script_frames(&self, assistant_message_id: MessageId, frames: Vec<StreamFrame>) {
        self.state().frames.insert(assistant_message_id, frames);
    }

    pub fn send_requests(&self) -> Vec<SendRequest> {
        self.state().send_requests.clone()
    }

    pub fn edit_requests(&self) -> Vec<EditRequest> {
        self.state().edit_requests.clone()
    }

    fn scripted_failure(message: String) -> RemoteError {
        RemoteError::UnexpectedStatus {
            stage: "scripted-outcome",
            status: 500,
            body: message,
        }
    }
}

impl ConversationService for ScriptedConversationService {
    fn create_conversation(
        &self,
        _document_id: Option<DocumentId>,
    ) -> BoxFuture<'_, RemoteResult<ConversationCreated>> {
        let existing = self.state().conversation;
        let created = existing.unwrap_or_else(|| self.seed_conversation());
        Box::pin(async move { Ok(created) })
    }

    fn fetch_tree(
        &self,
        _conversation_id: ConversationId,
    ) -> BoxFuture<'_, RemoteResult<Vec<WireMessage>>> {
        let tree = self.state().tree.clone();
        Box::pin(async move { Ok(tree) })
    }

    fn send_message(&self, request: SendRequest) -> BoxFuture<'_, RemoteResult<SendConfirmed>> {
        let outcome = {
            let mut state = self.state();
            state.send_requests.push(request);
            state.send_outcomes.pop_front()
        };

        Box::pin(async move {
            match outcome {
                Some(Ok(confirmed)) => Ok(confirmed),
                Some(Err(message)) => Err(Self::scripted_failure(message)),
                None => ScriptExhaustedSnafu {
                    stage: "scripted-send",
                    call: "send_message",
                }
                .fail(),
            }
        })
    }

    fn edit_message(&self, request: EditRequest) -> BoxFuture<'_, RemoteResult<EditConfirmed>> {
        let outcome = {
            let mut state = self.state();
            state.edit_requests.push(request);
            state.edit_outcomes.pop_front()
        };

        Box::pin(async move {
            match outcome {
                Some(Ok(confirmed)) => Ok(confirmed),
                Some(Err(message)) => Err(Self::scripted_failure(message)),
                None => ScriptExhaustedSnafu {
                    stage: "scripted-edit",
                    call: "edit_message",
                }
                .fail(),
            }
        })
    }

    fn open_stream(
        &self,
        _conversation_id: ConversationId,
        assistant_message_id: MessageId,
    ) -> RemoteResult<StreamHandle> {
        let frames = self
            .state()
            .frames
            .remove(&assistant_message_id)
            .ok_or_else(|| {
                ScriptExhaustedSnafu {
                    stage: "scripted-open-stream",
                    call: "open_stream",
                }
                .build()
            })?;

        let (event_tx, feed, mut cancel_rx) = make_stream_feed(assistant_message_id);
        let worker: FeedWorker = Box::pin(async move {
            for frame in frames {
                if cancel_rx.try_recv().is_ok() {
                    break;
                }
                // Yield between frames so readers observe arrival order.
                tokio::task::yield_now().await;

                let is_terminal = frame.is_terminal();
                if event_tx
                    .send(FeedEvent {
                        assistant_message_id,
                        frame,
                    })
                    .is_err()
                {
                    return;
                }
                if is_terminal {
                    return;
                }
            }
        });

        Ok(StreamHandle { feed, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_outcomes_are_consumed_in_order() {
        let service = ScriptedConversationService::new();
        let created = service.seed_conversation();
        let confirmed = service.queue_send_success();
        service.queue_send_failure("boom");

        let request = SendRequest {
            conversation_id: created.conversation_id,
            content: "hi".to_string(),
            parent_id: created.root_message_id,
            active_thread_ids: vec![created.root_message_id],
            block_context: None,
        };

        let first = service.send_message(request.clone()).await;
        assert_eq!(first.expect("first outcome"), confirmed);

        let second = service.send_message(request.clone()).await;
        assert!(matches!(second, Err(RemoteError::UnexpectedStatus { .. })));

        let third = service.send_message(request).await;
        assert!(matches!(third, Err(RemoteError::ScriptExhausted { .. })));
        assert_eq!(service.send_requests().len(), 3);
    }

    #[tokio::test]
    async fn scripted_feed_replays_frames_in_order() {
        let service = ScriptedConversationService::new();
        let created = service.seed_conversation();
        let assistant = MessageId::new_v7();
        service.script_frames(
            assistant,
            vec![
                StreamFrame::Delta {
                    text: "Hel".to_string(),
                },
                StreamFrame::Delta {
                    text: "lo".to_string(),
                },
                StreamFrame::Done,
            ],
        );

        let handle = service
            .open_stream(created.conversation_id, assistant)
            .expect("open scripted stream");
        let StreamHandle { mut feed, worker } = handle;
        tokio::spawn(worker);

        let mut collected = Vec::new();
        while let Some(event) = feed.recv().await {
            assert_eq!(event.assistant_message_id, assistant);
            collected.push(event.frame);
        }

        assert_eq!(
            collected,
            vec![
                StreamFrame::Delta {
                    text: "Hel".to_string()
                },
                StreamFrame::Delta {
                    text: "lo".to_string()
                },
                StreamFrame::Done,
            ]
        );
    }

    #[tokio::test]
    async fn unscripted_stream_is_rejected() {
        let service = ScriptedConversationService::new();
        let created = service.seed_conversation();
        let result = service.open_stream(created.conversation_id, MessageId::new_v7());
        assert!(matches!(result, Err(RemoteError::ScriptExhausted { .. })));
    }
}
