use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ensure};

use folio_remote::{BlockContext, ConversationId, EditRequest, MessageId, SendRequest, WireMessage};

use super::error::{
    ChatResult, DuplicateMessageSnafu, EditTargetNotUserSnafu, MissingRootSnafu,
    MutationInFlightSnafu, NoPendingExchangeSnafu, ProvisionalAnchorSnafu, RootIsImmovableSnafu,
    StreamBusySnafu, StreamRejectedSnafu, UnknownMessageSnafu,
};
use super::ids::{MessageKey, StreamSessionId};
use super::message::{MessageNode, MessageStatus, MessageView, Role};
use super::store::MessageStore;
use super::stream::{StreamBinding, StreamPhase, StreamRejection, StreamTransition};
use super::thread::resolve_active_thread;
use super::tree::MessageTree;

/// Which remote operation a pending exchange is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Send,
    Edit,
}

/// Wire request synthesized when an exchange begins; the caller forwards it
/// to the service unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeRequest {
    Send(SendRequest),
    Edit(EditRequest),
}

/// Bookkeeping for one optimistic send/edit awaiting server confirmation.
///
/// Holds exactly what rollback needs to return the tree to its pre-mutation
/// state: the two provisional keys and the parent pointer they displaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExchange {
    pub kind: ExchangeKind,
    pub user_key: MessageKey,
    pub assistant_key: MessageKey,
    pub parent_key: MessageKey,
    pub previous_active_child: Option<MessageKey>,
    pub request: ExchangeRequest,
}

/// Single-writer engine state for one conversation.
///
/// Every mutation is applied atomically through `&mut self` and followed by a
/// re-derivation of the active thread; the thread is a cache of derived
/// state, never a second source of truth.
pub struct ConversationSession {
    conversation_id: ConversationId,
    store: MessageStore,
    root: MessageKey,
    active_thread: Vec<MessageKey>,
    stream: StreamPhase,
    pending: Option<PendingExchange>,
    next_local_id: u64,
    next_session_id: u64,
}

impl ConversationSession {
    /// Creates a session for a freshly created conversation with its server
    /// root.
    pub fn new(conversation_id: ConversationId, root_message_id: MessageId) -> Self {
        let mut store = MessageStore::new();
        let root = MessageKey::Remote(root_message_id);
        // Inserting the root into an empty store cannot fail.
        let _ = store.insert(MessageNode::system_root(
            root,
            current_unix_timestamp_seconds(),
        ));

        let mut session = Self {
            conversation_id,
            store,
            root,
            active_thread: Vec::new(),
            stream: StreamPhase::default(),
            pending: None,
            next_local_id: 1,
            next_session_id: 1,
        };
        session.rederive();
        session
    }

    /// Builds a session from a full flat history snapshot.
    pub fn from_history(
        conversation_id: ConversationId,
        messages: Vec<WireMessage>,
    ) -> ChatResult<Self> {
        let (store, root) = Self::build_store(messages);
        let root = root.context(MissingRootSnafu {
            stage: "from-history",
        })?;

        let mut session = Self {
            conversation_id,
            store,
            root,
            active_thread: Vec::new(),
            stream: StreamPhase::default(),
            pending: None,
            next_local_id: 1,
            next_session_id: 1,
        };
        session.rederive();
        Ok(session)
    }

    /// Replaces the store with a fresh history snapshot.
    ///
    /// Refused while an exchange or stream is in flight; a refresh must never
    /// race a reconciliation.
    pub fn hydrate(&mut self, messages: Vec<WireMessage>) -> ChatResult<()> {
        ensure!(
            self.pending.is_none(),
            MutationInFlightSnafu { stage: "hydrate" }
        );
        if let Some(binding) = self.stream.active_binding() {
            return StreamBusySnafu {
                stage: "hydrate",
                key: binding.node,
            }
            .fail();
        }

        let (store, root) = Self::build_store(messages);
        let root = root.context(MissingRootSnafu { stage: "hydrate" })?;

        self.store = store;
        self.root = root;
        self.stream = StreamPhase::Idle;
        self.rederive();
        Ok(())
    }

    /// Inserts history rows parent-first, tolerating unordered input.
    ///
    /// Rows whose parent never materializes are logged and skipped; a broken
    /// row must not sink the whole refresh.
    fn build_store(messages: Vec<WireMessage>) -> (MessageStore, Option<MessageKey>) {
        let mut store = MessageStore::new();
        let mut root = None;
        let mut pending_rows = messages;

        loop {
            let mut made_progress = false;
            let mut deferred = Vec::new();

            for message in pending_rows {
                let parent_present = match message.parent_id {
                    Some(parent) => store.contains(MessageKey::Remote(parent)),
                    None => true,
                };
                if !parent_present {
                    deferred.push(message);
                    continue;
                }

                let key = MessageKey::Remote(message.id);
                let is_root = message.parent_id.is_none();
                match store.insert(MessageNode::from_wire(message)) {
                    Ok(()) => {
                        made_progress = true;
                        if is_root {
                            if root.is_none() {
                                root = Some(key);
                            } else {
                                tracing::warn!(
                                    key = %key,
                                    "history contains more than one parentless message"
                                );
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, key = %key, "skipping malformed history row");
                    }
                }
            }

            pending_rows = deferred;
            if pending_rows.is_empty() || !made_progress {
                break;
            }
        }

        for message in &pending_rows {
            tracing::warn!(id = %message.id, "skipping history row with unresolved parent");
        }

        (store, root)
    }

    /// Attaches a provisional user turn and assistant placeholder under the
    /// current leaf and synthesizes the send request.
    pub fn begin_send(
        &mut self,
        content: impl Into<String>,
        block_context: Option<BlockContext>,
    ) -> ChatResult<PendingExchange> {
        ensure!(
            self.pending.is_none(),
            MutationInFlightSnafu { stage: "begin-send" }
        );
        ensure!(
            !self.store.is_empty(),
            MissingRootSnafu { stage: "begin-send" }
        );

        let content = content.into();
        let parent_key = self.active_thread.last().copied().unwrap_or(self.root);
        let parent_id = parent_key.as_remote().ok_or_else(|| {
            ProvisionalAnchorSnafu {
                stage: "begin-send",
                key: parent_key,
            }
            .build()
        })?;
        self.ensure_not_rewiring_live_stream(parent_key, "begin-send")?;

        let previous_active_child = self
            .store
            .get(parent_key)
            .ok_or_else(|| {
                UnknownMessageSnafu {
                    stage: "begin-send",
                    key: parent_key,
                }
                .build()
            })?
            .active_child;
        let active_thread_ids = self.confirmed_thread_ids();

        let now = current_unix_timestamp_seconds();
        let user_key = self.alloc_local_key();
        let assistant_key = self.alloc_local_key();

        self.store.insert(MessageNode::user_pending(
            user_key,
            parent_key,
            content.clone(),
            block_context.clone(),
            now,
        ))?;
        self.store
            .insert(MessageNode::assistant_placeholder(assistant_key, user_key, now))?;
        self.store.set_active_child(parent_key, Some(user_key))?;
        self.store.set_active_child(user_key, Some(assistant_key))?;
        self.rederive();

        let pending = PendingExchange {
            kind: ExchangeKind::Send,
            user_key,
            assistant_key,
            parent_key,
            previous_active_child,
            request: ExchangeRequest::Send(SendRequest {
                conversation_id: self.conversation_id,
                content,
                parent_id,
                active_thread_ids,
                block_context,
            }),
        };
        self.pending = Some(pending.clone());
        tracing::debug!(user = %user_key, assistant = %assistant_key, "attached provisional send");
        Ok(pending)
    }

    /// Attaches a provisional sibling revision of `target` plus a fresh
    /// placeholder and synthesizes the edit request.
    ///
    /// The original message is never mutated; editing always produces a new
    /// branch under the original's parent.
    pub fn begin_edit(
        &mut self,
        target: MessageKey,
        content: impl Into<String>,
    ) -> ChatResult<PendingExchange> {
        ensure!(
            self.pending.is_none(),
            MutationInFlightSnafu { stage: "begin-edit" }
        );

        let content = content.into();
        let (parent_key, target_role, block_context) = {
            let node = self.store.get(target).ok_or_else(|| {
                UnknownMessageSnafu {
                    stage: "begin-edit",
                    key: target,
                }
                .build()
            })?;
            (node.parent, node.role, node.block_context.clone())
        };
        let parent_key = parent_key.ok_or_else(|| {
            RootIsImmovableSnafu {
                stage: "begin-edit",
                key: target,
            }
            .build()
        })?;
        ensure!(
            matches!(target_role, Role::User),
            EditTargetNotUserSnafu {
                stage: "begin-edit",
                key: target,
            }
        );
        let message_id = target.as_remote().ok_or_else(|| {
            ProvisionalAnchorSnafu {
                stage: "begin-edit",
                key: target,
            }
            .build()
        })?;
        self.ensure_not_rewiring_live_stream(parent_key, "begin-edit")?;

        let previous_active_child = self
            .store
            .get(parent_key)
            .ok_or_else(|| {
                UnknownMessageSnafu {
                    stage: "begin-edit",
                    key: parent_key,
                }
                .build()
            })?
            .active_child;
        let active_thread_ids = self.confirmed_thread_ids();

        let now = current_unix_timestamp_seconds();
        let user_key = self.alloc_local_key();
        let assistant_key = self.alloc_local_key();

        self.store.insert(MessageNode::user_pending(
            user_key,
            parent_key,
            content.clone(),
            block_context,
            now,
        ))?;
        self.store
            .insert(MessageNode::assistant_placeholder(assistant_key, user_key, now))?;
        self.store.set_active_child(parent_key, Some(user_key))?;
        self.store.set_active_child(user_key, Some(assistant_key))?;
        self.rederive();

        let pending = PendingExchange {
            kind: ExchangeKind::Edit,
            user_key,
            assistant_key,
            parent_key,
            previous_active_child,
            request: ExchangeRequest::Edit(EditRequest {
                conversation_id: self.conversation_id,
                message_id,
                content,
                active_thread_ids,
            }),
        };
        self.pending = Some(pending.clone());
        tracing::debug!(target = %target, revision = %user_key, "attached provisional edit");
        Ok(pending)
    }

    /// Replaces the pending exchange's provisional identities with
    /// server-confirmed ones and starts the stream phase on the assistant
    /// node.
    ///
    /// Content already accumulated on either node is preserved, never
    /// overwritten.
    pub fn confirm_exchange(
        &mut self,
        user_message_id: MessageId,
        assistant_message_id: MessageId,
    ) -> ChatResult<StreamBinding> {
        let pending = self.pending.clone().context(NoPendingExchangeSnafu {
            stage: "confirm-exchange",
        })?;

        let user_key = MessageKey::Remote(user_message_id);
        let assistant_key = MessageKey::Remote(assistant_message_id);
        // Validate both targets up front so a collision cannot leave the
        // store half-renamed.
        ensure!(
            !self.store.contains(user_key),
            DuplicateMessageSnafu {
                stage: "confirm-exchange",
                key: user_key,
            }
        );
        ensure!(
            !self.store.contains(assistant_key),
            DuplicateMessageSnafu {
                stage: "confirm-exchange",
                key: assistant_key,
            }
        );
        self.store.remap(pending.user_key, user_key)?;
        self.store.remap(pending.assistant_key, assistant_key)?;

        // A still-live stream from an earlier exchange is superseded, not an
        // error: the caller already decided to move on.
        if let Some(active) = self.stream.active_binding() {
            tracing::debug!(node = %active.node, "superseding live stream for a new exchange");
            self.stream = StreamPhase::Cancelled(active);
            if let Some(node) = self.store.get_mut(active.node) {
                node.status = MessageStatus::Cancelled;
            }
        }

        let session = self.alloc_session_id();
        let binding = StreamBinding::new(assistant_key, session);
        let next = self.apply_stream_transition(StreamTransition::Start(binding), "confirm-exchange")?;
        self.stream = next;

        if let Some(node) = self.store.get_mut(user_key) {
            node.status = MessageStatus::Done;
        }
        if let Some(node) = self.store.get_mut(assistant_key) {
            node.status = MessageStatus::Streaming(session);
        }

        self.pending = None;
        self.rederive();
        tracing::debug!(user = %user_key, assistant = %assistant_key, "confirmed exchange");
        Ok(binding)
    }

    /// Removes the pending provisional nodes and restores the displaced
    /// `active_child`, returning the thread exactly to its pre-mutation state.
    pub fn roll_back_exchange(&mut self) -> ChatResult<()> {
        let pending = self.pending.take().context(NoPendingExchangeSnafu {
            stage: "roll-back-exchange",
        })?;

        self.store.remove(pending.assistant_key);
        self.store.remove(pending.user_key);
        self.store
            .set_active_child(pending.parent_key, pending.previous_active_child)?;
        self.rederive();
        tracing::debug!(user = %pending.user_key, "rolled back provisional exchange");
        Ok(())
    }

    /// Appends one stream fragment to the bound node, in arrival order.
    pub fn apply_stream_delta(&mut self, binding: StreamBinding, text: &str) -> ChatResult<()> {
        if !self.stream.accepts(binding) {
            let rejection = match self.stream.active_binding() {
                Some(active) => StreamRejection::BindingMismatch {
                    active,
                    attempted: binding,
                },
                None => StreamRejection::NotStreaming,
            };
            tracing::warn!(node = %binding.node, rejection = ?rejection, "rejected stream delta");
            return StreamRejectedSnafu {
                stage: "apply-stream-delta",
                rejection,
            }
            .fail();
        }

        let node = self.store.get_mut(binding.node).ok_or_else(|| {
            UnknownMessageSnafu {
                stage: "apply-stream-delta",
                key: binding.node,
            }
            .build()
        })?;
        node.content.push_str(text);
        self.rederive();
        Ok(())
    }

    /// Marks the bound node final; later fragments for it are protocol errors.
    pub fn complete_stream(&mut self, binding: StreamBinding) -> ChatResult<()> {
        let next = self.apply_stream_transition(StreamTransition::Complete(binding), "complete-stream")?;
        self.stream = next;
        if let Some(node) = self.store.get_mut(binding.node) {
            node.status = MessageStatus::Done;
        }
        self.rederive();
        Ok(())
    }

    /// Flags the bound node as errored, keeping whatever content arrived.
    pub fn fail_stream(
        &mut self,
        binding: StreamBinding,
        message: impl Into<String>,
    ) -> ChatResult<()> {
        let message = message.into();
        let next = self.apply_stream_transition(
            StreamTransition::Fail {
                binding,
                message: message.clone(),
            },
            "fail-stream",
        )?;
        self.stream = next;
        if let Some(node) = self.store.get_mut(binding.node) {
            node.status = MessageStatus::Error(message);
        }
        self.rederive();
        Ok(())
    }

    /// Stops the live stream, keeping partial content as-is.
    ///
    /// Never fails; cancelling an idle session is a no-op.
    pub fn cancel_stream(&mut self) -> Option<StreamBinding> {
        let binding = self.stream.active_binding()?;
        self.stream = StreamPhase::Cancelled(binding);
        if let Some(node) = self.store.get_mut(binding.node) {
            node.status = MessageStatus::Cancelled;
        }
        self.rederive();
        tracing::debug!(node = %binding.node, "cancelled live stream");
        Some(binding)
    }

    /// Activates a sibling revision and reattaches the deepest previously
    /// explored continuation beneath it.
    ///
    /// A pure pointer rewrite: no message is created, removed, or edited.
    pub fn switch_version(&mut self, target: MessageKey) -> ChatResult<()> {
        let parent_key = {
            let node = self.store.get(target).ok_or_else(|| {
                UnknownMessageSnafu {
                    stage: "switch-version",
                    key: target,
                }
                .build()
            })?;
            node.parent.ok_or_else(|| {
                RootIsImmovableSnafu {
                    stage: "switch-version",
                    key: target,
                }
                .build()
            })?
        };
        self.ensure_not_rewiring_live_stream(parent_key, "switch-version")?;

        self.store.set_active_child(parent_key, Some(target))?;

        let tree = MessageTree::build(&self.store);
        let mut cursor = target;
        while let Some(latest) = tree.latest_child(cursor) {
            self.store.set_active_child(cursor, Some(latest))?;
            cursor = latest;
        }

        self.rederive();
        Ok(())
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn root(&self) -> MessageKey {
        self.root
    }

    /// The derived root-to-leaf path currently displayed.
    pub fn active_thread(&self) -> &[MessageKey] {
        &self.active_thread
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn stream_phase(&self) -> &StreamPhase {
        &self.stream
    }

    pub fn is_mutation_in_flight(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_stream_in_flight(&self) -> bool {
        self.stream.active_binding().is_some()
    }

    /// View models for the active thread, with sibling version positions.
    pub fn thread_views(&self) -> Vec<MessageView> {
        let tree = MessageTree::build(&self.store);

        self.active_thread
            .iter()
            .filter_map(|key| {
                let node = self.store.get(*key)?;
                let siblings = node
                    .parent
                    .map(|parent| tree.children_of(parent))
                    .unwrap_or(&[]);
                let sibling_count = siblings.len().max(1);
                let sibling_index = siblings
                    .iter()
                    .position(|sibling| sibling == key)
                    .unwrap_or(0);

                Some(MessageView {
                    key: *key,
                    role: node.role,
                    content: node.content.clone(),
                    status: node.status.clone(),
                    sibling_index,
                    sibling_count,
                    block_context: node.block_context.clone(),
                })
            })
            .collect()
    }

    /// Server-confirmed identities of the current active thread, in order.
    fn confirmed_thread_ids(&self) -> Vec<MessageId> {
        self.active_thread
            .iter()
            .filter_map(|key| key.as_remote())
            .collect()
    }

    /// Refuses to rewrite `active_child` at or above the node a live stream
    /// is appending into; switching away from the streaming position would
    /// tear the thread out from under the reconciler.
    fn ensure_not_rewiring_live_stream(
        &self,
        parent_key: MessageKey,
        stage: &'static str,
    ) -> ChatResult<()> {
        let Some(binding) = self.stream.active_binding() else {
            return Ok(());
        };
        let Some(stream_pos) = self
            .active_thread
            .iter()
            .position(|key| *key == binding.node)
        else {
            return Ok(());
        };

        if let Some(parent_pos) = self.active_thread.iter().position(|key| *key == parent_key)
            && parent_pos < stream_pos
        {
            return StreamBusySnafu {
                stage,
                key: binding.node,
            }
            .fail();
        }

        Ok(())
    }

    fn apply_stream_transition(
        &self,
        transition: StreamTransition,
        stage: &'static str,
    ) -> ChatResult<StreamPhase> {
        self.stream.apply(transition).map_err(|rejection| {
            tracing::warn!(stage, rejection = ?rejection, "rejected stream transition");
            StreamRejectedSnafu { stage, rejection }.build()
        })
    }

    fn rederive(&mut self) {
        self.active_thread = resolve_active_thread(&self.store, self.root);
    }

    fn alloc_local_key(&mut self) -> MessageKey {
        let key = MessageKey::local(self.next_local_id);
        self.next_local_id = self.next_local_id.saturating_add(1);
        key
    }

    fn alloc_session_id(&mut self) -> StreamSessionId {
        let session = StreamSessionId::new(self.next_session_id);
        self.next_session_id = self.next_session_id.saturating_add(1);
        session
    }
}

pub(crate) fn current_unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
