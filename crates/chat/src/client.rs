use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use snafu::ResultExt;
use tokio::task::JoinHandle;

use folio_remote::{
    BlockContext, ConversationId, ConversationService, DocumentId, StreamFrame, StreamHandle,
};

use super::error::{ChatResult, MutationInFlightSnafu, ProvisionalAnchorSnafu, RemoteSnafu};
use super::ids::MessageKey;
use super::message::MessageView;
use super::session::{ConversationSession, ExchangeKind, ExchangeRequest, PendingExchange};
use super::stream::StreamBinding;

/// Headless coordinator binding one conversation session to the remote
/// conversation service.
///
/// The session mutex is held only for atomic engine steps, never across an
/// await; the remote round-trip and the streaming feed run outside it.
pub struct ChatClient {
    service: Arc<dyn ConversationService>,
    session: Arc<Mutex<ConversationSession>>,
    mutation_in_flight: Arc<AtomicBool>,
    tasks: Mutex<StreamTasks>,
}

#[derive(Default)]
struct StreamTasks {
    worker: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// Creates a fresh conversation on the service and hydrates from it.
    pub async fn open(
        service: Arc<dyn ConversationService>,
        document_id: Option<DocumentId>,
    ) -> ChatResult<Self> {
        let created = service
            .create_conversation(document_id)
            .await
            .context(RemoteSnafu {
                stage: "create-conversation",
            })?;
        let history = service
            .fetch_tree(created.conversation_id)
            .await
            .context(RemoteSnafu { stage: "fetch-tree" })?;

        let mut session = ConversationSession::new(created.conversation_id, created.root_message_id);
        session.hydrate(history)?;
        Ok(Self::from_session(service, session))
    }

    /// Attaches to an existing conversation by fetching its full history.
    pub async fn attach(
        service: Arc<dyn ConversationService>,
        conversation_id: ConversationId,
    ) -> ChatResult<Self> {
        let history = service
            .fetch_tree(conversation_id)
            .await
            .context(RemoteSnafu { stage: "fetch-tree" })?;
        let session = ConversationSession::from_history(conversation_id, history)?;
        Ok(Self::from_session(service, session))
    }

    fn from_session(service: Arc<dyn ConversationService>, session: ConversationSession) -> Self {
        Self {
            service,
            session: Arc::new(Mutex::new(session)),
            mutation_in_flight: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(StreamTasks::default()),
        }
    }

    /// Sends a user message: optimistic insert, remote round-trip, then a
    /// streaming feed for the assistant reply.
    ///
    /// On transport failure the provisional nodes are rolled back and the
    /// thread returns exactly to its pre-send state.
    pub async fn send(
        &self,
        content: impl Into<String>,
        block_context: Option<BlockContext>,
    ) -> ChatResult<()> {
        let content = content.into();
        self.run_exchange(move |session| session.begin_send(content, block_context))
            .await
    }

    /// Edits a user message, producing a new sibling branch.
    pub async fn edit(&self, target: MessageKey, content: impl Into<String>) -> ChatResult<()> {
        let content = content.into();
        self.run_exchange(move |session| session.begin_edit(target, content))
            .await
    }

    async fn run_exchange(
        &self,
        begin: impl FnOnce(&mut ConversationSession) -> ChatResult<PendingExchange>,
    ) -> ChatResult<()> {
        // Only one outstanding send/edit; a second request is rejected, the
        // caller decides whether to queue.
        if self.mutation_in_flight.swap(true, Ordering::SeqCst) {
            return MutationInFlightSnafu {
                stage: "client-exchange",
            }
            .fail();
        }

        let result = self.drive_exchange(begin).await;
        self.mutation_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn drive_exchange(
        &self,
        begin: impl FnOnce(&mut ConversationSession) -> ChatResult<PendingExchange>,
    ) -> ChatResult<()> {
        let pending = begin(&mut self.lock_session())?;

        let stage = match pending.kind {
            ExchangeKind::Send => "send-message",
            ExchangeKind::Edit => "edit-message",
        };
        let outcome = match pending.request {
            ExchangeRequest::Send(request) => self
                .service
                .send_message(request)
                .await
                .map(|confirmed| (confirmed.user_message_id, confirmed.assistant_message_id)),
            ExchangeRequest::Edit(request) => self
                .service
                .edit_message(request)
                .await
                .map(|confirmed| (confirmed.edited_message_id, confirmed.assistant_message_id)),
        };

        match outcome {
            Ok((user_message_id, assistant_message_id)) => {
                let confirmed = self
                    .lock_session()
                    .confirm_exchange(user_message_id, assistant_message_id);
                let binding = match confirmed {
                    Ok(binding) => binding,
                    Err(error) => {
                        // A failed reconciliation must not strand the
                        // provisional nodes.
                        if let Err(rollback_error) = self.lock_session().roll_back_exchange() {
                            tracing::warn!(error = %rollback_error, "rollback after failed confirm");
                        }
                        return Err(error);
                    }
                };
                self.spawn_stream(binding)?;
                Ok(())
            }
            Err(source) => {
                self.lock_session().roll_back_exchange()?;
                Err(source).context(RemoteSnafu { stage })
            }
        }
    }

    fn spawn_stream(&self, binding: StreamBinding) -> ChatResult<()> {
        let (conversation_id, assistant_message_id) = {
            let session = self.lock_session();
            let assistant = binding.node.as_remote().ok_or_else(|| {
                ProvisionalAnchorSnafu {
                    stage: "spawn-stream",
                    key: binding.node,
                }
                .build()
            })?;
            (session.conversation_id(), assistant)
        };

        let handle = match self.service.open_stream(conversation_id, assistant_message_id) {
            Ok(handle) => handle,
            Err(source) => {
                // The exchange is already confirmed; surface the failure on
                // the node rather than tearing the tree down.
                self.lock_session()
                    .fail_stream(binding, source.to_string())?;
                return Err(source).context(RemoteSnafu {
                    stage: "open-stream",
                });
            }
        };

        let StreamHandle { mut feed, worker } = handle;
        let session = Arc::clone(&self.session);
        let reader = tokio::spawn(async move {
            let mut saw_terminal = false;

            while let Some(event) = feed.recv().await {
                let applied = {
                    let mut session = lock_session_arc(&session);
                    match event.frame {
                        StreamFrame::Delta { text } => session.apply_stream_delta(binding, &text),
                        StreamFrame::Done => {
                            saw_terminal = true;
                            session.complete_stream(binding)
                        }
                        StreamFrame::Error { message } => {
                            saw_terminal = true;
                            session.fail_stream(binding, message)
                        }
                    }
                };

                if let Err(error) = applied {
                    tracing::warn!(node = %binding.node, error = %error, "dropped stream frame");
                }
                if saw_terminal {
                    break;
                }
            }

            if !saw_terminal {
                let mut session = lock_session_arc(&session);
                if let Err(error) =
                    session.fail_stream(binding, "stream reader closed before a terminal frame")
                {
                    tracing::debug!(node = %binding.node, error = %error, "stream already finalized");
                }
            }
        });

        let mut tasks = self.lock_tasks();
        tasks.worker = Some(tokio::spawn(worker));
        tasks.reader = Some(reader);
        Ok(())
    }

    /// Closes the live streaming feed, keeping partial content as-is.
    ///
    /// Safe to call at any time; cancelling with no live stream is a no-op.
    pub fn cancel_stream(&self) {
        {
            let mut tasks = self.lock_tasks();
            // Aborting the reader drops the feed, which signals the worker to
            // stop reading from the transport.
            if let Some(reader) = tasks.reader.take() {
                reader.abort();
            }
            if let Some(worker) = tasks.worker.take() {
                worker.abort();
            }
        }

        self.lock_session().cancel_stream();
    }

    /// Activates a sibling revision; rejected while the live stream's
    /// ancestry would be rewired.
    pub fn switch_version(&self, target: MessageKey) -> ChatResult<()> {
        self.lock_session().switch_version(target)
    }

    /// Re-fetches the full history; refused while an exchange or stream is in
    /// flight.
    pub async fn refresh(&self) -> ChatResult<()> {
        let conversation_id = self.conversation_id();
        let history = self
            .service
            .fetch_tree(conversation_id)
            .await
            .context(RemoteSnafu { stage: "fetch-tree" })?;
        self.lock_session().hydrate(history)
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.lock_session().conversation_id()
    }

    /// View models for the currently displayed root-to-leaf path.
    pub fn active_thread(&self) -> Vec<MessageView> {
        self.lock_session().thread_views()
    }

    pub fn is_mutation_in_flight(&self) -> bool {
        self.mutation_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_stream_in_flight(&self) -> bool {
        self.lock_session().is_stream_in_flight()
    }

    fn lock_session(&self) -> MutexGuard<'_, ConversationSession> {
        lock_session_arc(&self.session)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, StreamTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        let mut tasks = self.lock_tasks();
        if let Some(reader) = tasks.reader.take() {
            reader.abort();
        }
        if let Some(worker) = tasks.worker.take() {
            worker.abort();
        }
    }
}

fn lock_session_arc(session: &Mutex<ConversationSession>) -> MutexGuard<'_, ConversationSession> {
    session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::message::{MessageStatus, Role};
    use folio_remote::ScriptedConversationService;
    use std::time::Duration;

    async fn wait_for_stream_idle(client: &ChatClient) {
        for _ in 0..200 {
            if !client.is_stream_in_flight() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream never reached an idle state");
    }

    fn delta(text: &str) -> StreamFrame {
        StreamFrame::Delta {
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn send_round_trip_streams_into_the_confirmed_node() {
        let service = Arc::new(ScriptedConversationService::new());
        service.seed_conversation();
        let confirmed = service.queue_send_success();
        service.script_frames(
            confirmed.assistant_message_id,
            vec![delta("Hello"), delta("!"), StreamFrame::Done],
        );

        let client = ChatClient::open(service.clone(), None)
            .await
            .expect("open conversation");
        client.send("hi", None).await.expect("send");
        wait_for_stream_idle(&client).await;

        let thread = client.active_thread();
        assert_eq!(thread.len(), 3);
        assert_eq!(thread[0].role, Role::System);
        assert_eq!(thread[1].content, "hi");
        assert_eq!(thread[2].content, "Hello!");
        assert_eq!(thread[2].status, MessageStatus::Done);

        let request = &service.send_requests()[0];
        assert_eq!(request.content, "hi");
        assert_eq!(request.active_thread_ids.len(), 1);
    }

    #[tokio::test]
    async fn failed_send_rolls_the_thread_back() {
        let service = Arc::new(ScriptedConversationService::new());
        service.seed_conversation();
        service.queue_send_failure("backend unavailable");

        let client = ChatClient::open(service.clone(), None)
            .await
            .expect("open conversation");
        let before: Vec<_> = client.active_thread().iter().map(|view| view.key).collect();

        let result = client.send("hi", None).await;
        assert!(matches!(result, Err(ChatError::Remote { .. })));

        let after: Vec<_> = client.active_thread().iter().map(|view| view.key).collect();
        assert_eq!(before, after);
        assert!(!client.is_mutation_in_flight());
        assert!(!client.is_stream_in_flight());
    }

    #[tokio::test]
    async fn stream_without_terminal_frame_flags_the_node() {
        let service = Arc::new(ScriptedConversationService::new());
        service.seed_conversation();
        let confirmed = service.queue_send_success();
        service.script_frames(confirmed.assistant_message_id, vec![delta("par")]);

        let client = ChatClient::open(service.clone(), None)
            .await
            .expect("open conversation");
        client.send("hi", None).await.expect("send");
        wait_for_stream_idle(&client).await;

        let thread = client.active_thread();
        assert_eq!(thread[2].content, "par");
        assert!(matches!(thread[2].status, MessageStatus::Error(_)));
    }

    #[tokio::test]
    async fn edit_builds_a_sibling_branch_through_the_service() {
        let service = Arc::new(ScriptedConversationService::new());
        service.seed_conversation();
        let send_confirmed = service.queue_send_success();
        service.script_frames(
            send_confirmed.assistant_message_id,
            vec![delta("first reply"), StreamFrame::Done],
        );

        let client = ChatClient::open(service.clone(), None)
            .await
            .expect("open conversation");
        client.send("draft", None).await.expect("send");
        wait_for_stream_idle(&client).await;

        let edit_confirmed = service.queue_edit_success();
        service.script_frames(
            edit_confirmed.assistant_message_id,
            vec![delta("second reply"), StreamFrame::Done],
        );

        let target = client.active_thread()[1].key;
        client.edit(target, "revised draft").await.expect("edit");
        wait_for_stream_idle(&client).await;

        let thread = client.active_thread();
        assert_eq!(thread[1].content, "revised draft");
        assert_eq!(thread[1].sibling_count, 2);
        assert_eq!(thread[2].content, "second reply");

        // The original branch is intact and switchable.
        client.switch_version(target).expect("switch back");
        let original = client.active_thread();
        assert_eq!(original[1].content, "draft");
        assert_eq!(original[2].content, "first reply");
    }

    #[tokio::test]
    async fn cancel_stream_is_safe_whenever_called() {
        let service = Arc::new(ScriptedConversationService::new());
        service.seed_conversation();
        let confirmed = service.queue_send_success();
        service.script_frames(
            confirmed.assistant_message_id,
            vec![delta("Hel"), delta("lo"), StreamFrame::Done],
        );

        let client = ChatClient::open(service.clone(), None)
            .await
            .expect("open conversation");
        client.cancel_stream();

        client.send("hi", None).await.expect("send");
        client.cancel_stream();
        wait_for_stream_idle(&client).await;

        // Whatever had arrived stays; the node is in a terminal state.
        let thread = client.active_thread();
        assert!(matches!(
            thread[2].status,
            MessageStatus::Cancelled | MessageStatus::Done
        ));
        client.cancel_stream();
    }
}
