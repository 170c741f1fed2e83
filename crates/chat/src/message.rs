use folio_remote::{BlockContext, WireMessage, WireRole};

use super::ids::{MessageKey, StreamSessionId};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<WireRole> for Role {
    fn from(value: WireRole) -> Self {
        match value {
            WireRole::System => Self::System,
            WireRole::User => Self::User,
            WireRole::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for WireRole {
    fn from(value: Role) -> Self {
        match value {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Streaming(StreamSessionId),
    Done,
    Error(String),
    Cancelled,
}

/// One node of the conversation tree.
///
/// `parent` is fixed at insertion and never reassigned (identity remaps
/// excepted); `active_child` is the only state that encodes branch selection.
/// `seq` is the store insertion sequence, used to break same-second ties when
/// ordering sibling versions chronologically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageNode {
    pub key: MessageKey,
    pub role: Role,
    pub content: String,
    pub parent: Option<MessageKey>,
    pub active_child: Option<MessageKey>,
    pub created_at_unix_seconds: u64,
    pub seq: u64,
    pub status: MessageStatus,
    pub block_context: Option<BlockContext>,
}

impl MessageNode {
    pub fn new(
        key: MessageKey,
        role: Role,
        content: impl Into<String>,
        parent: Option<MessageKey>,
        created_at_unix_seconds: u64,
        status: MessageStatus,
    ) -> Self {
        Self {
            key,
            role,
            content: content.into(),
            parent,
            active_child: None,
            created_at_unix_seconds,
            seq: 0,
            status,
            block_context: None,
        }
    }

    /// Creates the conversation root system message.
    pub fn system_root(key: MessageKey, created_at_unix_seconds: u64) -> Self {
        Self::new(
            key,
            Role::System,
            String::new(),
            None,
            created_at_unix_seconds,
            MessageStatus::Done,
        )
    }

    /// Creates a provisional user message awaiting confirmation.
    pub fn user_pending(
        key: MessageKey,
        parent: MessageKey,
        content: impl Into<String>,
        block_context: Option<BlockContext>,
        created_at_unix_seconds: u64,
    ) -> Self {
        let mut node = Self::new(
            key,
            Role::User,
            content,
            Some(parent),
            created_at_unix_seconds,
            MessageStatus::Pending,
        );
        node.block_context = block_context;
        node
    }

    /// Creates an empty assistant placeholder the stream will fill.
    pub fn assistant_placeholder(
        key: MessageKey,
        parent: MessageKey,
        created_at_unix_seconds: u64,
    ) -> Self {
        Self::new(
            key,
            Role::Assistant,
            String::new(),
            Some(parent),
            created_at_unix_seconds,
            MessageStatus::Pending,
        )
    }

    /// Converts one server history row into a node.
    pub fn from_wire(message: WireMessage) -> Self {
        Self {
            key: MessageKey::Remote(message.id),
            role: message.role.into(),
            content: message.content,
            parent: message.parent_id.map(MessageKey::Remote),
            active_child: message.active_child_id.map(MessageKey::Remote),
            created_at_unix_seconds: message.created_at_unix_seconds,
            seq: 0,
            status: MessageStatus::Done,
            block_context: None,
        }
    }
}

/// UI-facing projection of one active-thread entry.
///
/// `sibling_index`/`sibling_count` drive "version m of n" switch affordances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub key: MessageKey,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub sibling_index: usize,
    pub sibling_count: usize,
    pub block_context: Option<BlockContext>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_remote::MessageId;

    #[test]
    fn wire_roles_map_both_ways() {
        for role in [WireRole::System, WireRole::User, WireRole::Assistant] {
            let engine_role: Role = role.into();
            let back: WireRole = engine_role.into();
            assert_eq!(back, role);
        }
    }

    #[test]
    fn from_wire_keeps_pointers_remote() {
        let parent = MessageId::new_v7();
        let child = MessageId::new_v7();
        let id = MessageId::new_v7();
        let node = MessageNode::from_wire(
            WireMessage::new(id, WireRole::Assistant, "body", 1_700_000_001)
                .with_parent(parent)
                .with_active_child(child),
        );

        assert_eq!(node.key, MessageKey::Remote(id));
        assert_eq!(node.parent, Some(MessageKey::Remote(parent)));
        assert_eq!(node.active_child, Some(MessageKey::Remote(child)));
        assert_eq!(node.status, MessageStatus::Done);
    }
}
