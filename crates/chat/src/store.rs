use std::collections::HashMap;

use snafu::ensure;

use super::error::{
    ChatResult, DanglingParentSnafu, DuplicateMessageSnafu, InvalidActiveChildSnafu,
    UnknownMessageSnafu,
};
use super::ids::MessageKey;
use super::message::MessageNode;

/// Flat collection of every known message for one conversation.
///
/// The store exclusively owns all message nodes; every other component refers
/// to them by key and derives structure from this ground truth.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    nodes: HashMap<MessageKey, MessageNode>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: MessageKey) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn get(&self, key: MessageKey) -> Option<&MessageNode> {
        self.nodes.get(&key)
    }

    pub fn get_mut(&mut self, key: MessageKey) -> Option<&mut MessageNode> {
        self.nodes.get_mut(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageNode> {
        self.nodes.values()
    }

    /// Inserts a node, assigning its insertion sequence.
    ///
    /// Duplicate keys and dangling parent references are rejected; a dangling
    /// parent is a reconciliation bug, not a valid state.
    pub fn insert(&mut self, mut node: MessageNode) -> ChatResult<()> {
        ensure!(
            !self.nodes.contains_key(&node.key),
            DuplicateMessageSnafu {
                stage: "store-insert",
                key: node.key,
            }
        );

        if let Some(parent) = node.parent {
            ensure!(
                self.nodes.contains_key(&parent),
                DanglingParentSnafu {
                    stage: "store-insert",
                    key: node.key,
                    parent,
                }
            );
        }

        node.seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.nodes.insert(node.key, node);
        Ok(())
    }

    pub fn remove(&mut self, key: MessageKey) -> Option<MessageNode> {
        self.nodes.remove(&key)
    }

    /// Points `parent`'s active child at `child` (or clears it).
    ///
    /// The child must exist and must actually be a child of `parent`.
    pub fn set_active_child(
        &mut self,
        parent: MessageKey,
        child: Option<MessageKey>,
    ) -> ChatResult<()> {
        if let Some(child_key) = child {
            let child_node = self.nodes.get(&child_key).ok_or_else(|| {
                UnknownMessageSnafu {
                    stage: "set-active-child",
                    key: child_key,
                }
                .build()
            })?;

            ensure!(
                child_node.parent == Some(parent),
                InvalidActiveChildSnafu {
                    stage: "set-active-child",
                    parent,
                    child: child_key,
                }
            );
        }

        let parent_node = self.nodes.get_mut(&parent).ok_or_else(|| {
            UnknownMessageSnafu {
                stage: "set-active-child",
                key: parent,
            }
            .build()
        })?;

        parent_node.active_child = child;
        Ok(())
    }

    /// Rewrites a provisional key to its server-confirmed key.
    ///
    /// Content, status, timestamps, and tree position are preserved; every
    /// reference to the old key (children's `parent`, any `active_child`) is
    /// rewritten so the rename is invisible to derivation.
    pub fn remap(&mut self, old: MessageKey, new: MessageKey) -> ChatResult<()> {
        ensure!(
            !self.nodes.contains_key(&new),
            DuplicateMessageSnafu {
                stage: "store-remap",
                key: new,
            }
        );

        let mut node = self.nodes.remove(&old).ok_or_else(|| {
            UnknownMessageSnafu {
                stage: "store-remap",
                key: old,
            }
            .build()
        })?;
        node.key = new;
        self.nodes.insert(new, node);

        for node in self.nodes.values_mut() {
            if node.parent == Some(old) {
                node.parent = Some(new);
            }
            if node.active_child == Some(old) {
                node.active_child = Some(new);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::message::{MessageStatus, Role};
    use folio_remote::MessageId;

    fn node(key: MessageKey, parent: Option<MessageKey>) -> MessageNode {
        MessageNode::new(
            key,
            Role::User,
            "body",
            parent,
            1_700_000_000,
            MessageStatus::Done,
        )
    }

    #[test]
    fn insert_assigns_monotonic_sequence() {
        let mut store = MessageStore::new();
        let a = MessageKey::local(1);
        let b = MessageKey::local(2);
        store.insert(node(a, None)).expect("insert a");
        store.insert(node(b, Some(a))).expect("insert b");

        let seq_a = store.get(a).expect("a present").seq;
        let seq_b = store.get(b).expect("b present").seq;
        assert!(seq_a < seq_b);
    }

    #[test]
    fn duplicate_and_dangling_inserts_are_rejected() {
        let mut store = MessageStore::new();
        let a = MessageKey::local(1);
        store.insert(node(a, None)).expect("insert a");

        let duplicate = store.insert(node(a, None));
        assert!(matches!(duplicate, Err(ChatError::DuplicateMessage { .. })));

        let dangling = store.insert(node(MessageKey::local(2), Some(MessageKey::local(99))));
        assert!(matches!(dangling, Err(ChatError::DanglingParent { .. })));
    }

    #[test]
    fn active_child_must_be_an_actual_child() {
        let mut store = MessageStore::new();
        let root = MessageKey::local(1);
        let child = MessageKey::local(2);
        let stranger = MessageKey::local(3);
        store.insert(node(root, None)).expect("insert root");
        store.insert(node(child, Some(root))).expect("insert child");
        store.insert(node(stranger, None)).expect("insert stranger");

        store
            .set_active_child(root, Some(child))
            .expect("child accepted");

        let rejected = store.set_active_child(root, Some(stranger));
        assert!(matches!(rejected, Err(ChatError::InvalidActiveChild { .. })));

        store.set_active_child(root, None).expect("clear accepted");
    }

    #[test]
    fn remap_preserves_content_and_rewrites_pointers() {
        let mut store = MessageStore::new();
        let root = MessageKey::local(1);
        let provisional = MessageKey::local(2);
        let grandchild = MessageKey::local(3);
        store.insert(node(root, None)).expect("insert root");

        let mut streamed = node(provisional, Some(root));
        streamed.content = "partially streamed".to_string();
        store.insert(streamed).expect("insert provisional");
        store
            .insert(node(grandchild, Some(provisional)))
            .expect("insert grandchild");
        store
            .set_active_child(root, Some(provisional))
            .expect("point root");
        store
            .set_active_child(provisional, Some(grandchild))
            .expect("point provisional");

        let confirmed = MessageKey::remote(MessageId::new_v7());
        store.remap(provisional, confirmed).expect("remap");

        assert!(store.get(provisional).is_none());
        let renamed = store.get(confirmed).expect("confirmed present");
        assert_eq!(renamed.content, "partially streamed");
        assert_eq!(renamed.active_child, Some(grandchild));
        assert_eq!(store.get(root).expect("root").active_child, Some(confirmed));
        assert_eq!(
            store.get(grandchild).expect("grandchild").parent,
            Some(confirmed)
        );
    }

    #[test]
    fn remap_rejects_unknown_source_and_occupied_target() {
        let mut store = MessageStore::new();
        let a = MessageKey::local(1);
        let b = MessageKey::local(2);
        store.insert(node(a, None)).expect("insert a");
        store.insert(node(b, Some(a))).expect("insert b");

        let missing = store.remap(MessageKey::local(9), MessageKey::remote(MessageId::new_v7()));
        assert!(matches!(missing, Err(ChatError::UnknownMessage { .. })));

        let occupied = store.remap(a, b);
        assert!(matches!(occupied, Err(ChatError::DuplicateMessage { .. })));
    }
}
