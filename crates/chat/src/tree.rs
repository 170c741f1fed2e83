use std::collections::{HashMap, HashSet};

use super::ids::MessageKey;
use super::store::MessageStore;

/// Derived parent/child view of the message store.
///
/// Building is pure and idempotent: the same store contents always produce a
/// structurally equal tree. The tree is rebuilt after every store mutation and
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTree {
    roots: Vec<MessageKey>,
    children: HashMap<MessageKey, Vec<MessageKey>>,
}

impl MessageTree {
    /// Builds the forest in two passes: index every node, then attach each
    /// node under its parent when the parent is present in the index, else
    /// treat it as a root.
    pub fn build(store: &MessageStore) -> Self {
        let mut nodes: Vec<_> = store.iter().collect();
        // Chronological order with insertion-sequence tie-break keeps sibling
        // version lists deterministic.
        nodes.sort_by_key(|node| (node.created_at_unix_seconds, node.seq));

        let mut roots = Vec::new();
        let mut children: HashMap<MessageKey, Vec<MessageKey>> = HashMap::new();

        for node in nodes {
            match node.parent {
                Some(parent) if store.contains(parent) => {
                    children.entry(parent).or_default().push(node.key);
                }
                _ => roots.push(node.key),
            }
        }

        Self { roots, children }
    }

    pub fn roots(&self) -> &[MessageKey] {
        &self.roots
    }

    /// Children of `key` in chronological order; empty for leaves.
    pub fn children_of(&self, key: MessageKey) -> &[MessageKey] {
        self.children.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recently created child of `key`, if any.
    pub fn latest_child(&self, key: MessageKey) -> Option<MessageKey> {
        self.children_of(key).last().copied()
    }

    /// True when the forest has exactly one root and every stored node is
    /// reachable exactly once from it.
    pub fn is_well_formed(&self, store: &MessageStore) -> bool {
        if self.roots.len() != 1 {
            return false;
        }

        let mut seen = HashSet::new();
        let mut pending = self.roots.clone();

        while let Some(key) = pending.pop() {
            if !seen.insert(key) {
                return false;
            }
            pending.extend_from_slice(self.children_of(key));
        }

        seen.len() == store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageNode, MessageStatus, Role};

    fn insert(store: &mut MessageStore, key: MessageKey, parent: Option<MessageKey>, at: u64) {
        store
            .insert(MessageNode::new(
                key,
                Role::User,
                "",
                parent,
                at,
                MessageStatus::Done,
            ))
            .expect("fixture insert");
    }

    fn fixture_store() -> MessageStore {
        let mut store = MessageStore::new();
        insert(&mut store, MessageKey::local(1), None, 100);
        insert(&mut store, MessageKey::local(2), Some(MessageKey::local(1)), 200);
        insert(&mut store, MessageKey::local(3), Some(MessageKey::local(1)), 300);
        insert(&mut store, MessageKey::local(4), Some(MessageKey::local(2)), 400);
        store
    }

    #[test]
    fn build_is_idempotent() {
        let store = fixture_store();
        assert_eq!(MessageTree::build(&store), MessageTree::build(&store));
    }

    #[test]
    fn children_are_ordered_chronologically_with_seq_tiebreak() {
        let mut store = MessageStore::new();
        let root = MessageKey::local(1);
        insert(&mut store, root, None, 100);
        // Same-second siblings resolve by insertion order.
        insert(&mut store, MessageKey::local(2), Some(root), 200);
        insert(&mut store, MessageKey::local(3), Some(root), 200);
        insert(&mut store, MessageKey::local(4), Some(root), 150);

        let tree = MessageTree::build(&store);
        assert_eq!(
            tree.children_of(root),
            &[
                MessageKey::local(4),
                MessageKey::local(2),
                MessageKey::local(3)
            ]
        );
        assert_eq!(tree.latest_child(root), Some(MessageKey::local(3)));
    }

    #[test]
    fn node_with_missing_parent_becomes_a_root() {
        let mut store = MessageStore::new();
        insert(&mut store, MessageKey::local(1), None, 100);
        insert(&mut store, MessageKey::local(2), Some(MessageKey::local(1)), 200);

        // Simulated corruption: orphan the child after insertion.
        store
            .get_mut(MessageKey::local(2))
            .expect("child present")
            .parent = Some(MessageKey::local(99));

        let tree = MessageTree::build(&store);
        assert_eq!(tree.roots().len(), 2);
        assert!(!tree.is_well_formed(&store));
    }

    #[test]
    fn single_root_forest_is_well_formed() {
        let store = fixture_store();
        let tree = MessageTree::build(&store);
        assert_eq!(tree.roots(), &[MessageKey::local(1)]);
        assert!(tree.is_well_formed(&store));
    }
}
