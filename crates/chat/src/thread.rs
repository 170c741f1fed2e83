use super::ids::MessageKey;
use super::store::MessageStore;

/// Resolves the active thread: the root-to-leaf key sequence obtained by
/// following `active_child` pointers until the first absent one.
///
/// Resolution never fails: a pointer to a missing node, a pointer to a node
/// that does not point back to its parent, and a walk longer than the store
/// are all logged and terminate the walk early, leaving the prefix intact.
/// Cost is linear in thread length, independent of total tree size.
pub fn resolve_active_thread(store: &MessageStore, root: MessageKey) -> Vec<MessageKey> {
    let mut thread = Vec::new();

    let Some(mut current) = store.get(root) else {
        tracing::warn!(root = %root, "active-thread root is missing from the store");
        return thread;
    };
    thread.push(current.key);

    let mut steps = 0usize;
    while let Some(next_key) = current.active_child {
        steps += 1;
        if steps > store.len() {
            tracing::warn!(
                node = %current.key,
                "active-thread walk exceeded store size; stopping"
            );
            break;
        }

        let Some(next) = store.get(next_key) else {
            tracing::warn!(
                node = %current.key,
                child = %next_key,
                "active child is missing from the store; stopping"
            );
            break;
        };

        if next.parent != Some(current.key) {
            tracing::warn!(
                node = %current.key,
                child = %next_key,
                "active child does not point back to its parent; stopping"
            );
            break;
        }

        thread.push(next_key);
        current = next;
    }

    thread
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageNode, MessageStatus, Role};

    fn insert(store: &mut MessageStore, key: MessageKey, parent: Option<MessageKey>) {
        store
            .insert(MessageNode::new(
                key,
                Role::User,
                "",
                parent,
                1_700_000_000,
                MessageStatus::Done,
            ))
            .expect("fixture insert");
    }

    fn chain_store() -> MessageStore {
        let mut store = MessageStore::new();
        insert(&mut store, MessageKey::local(1), None);
        insert(&mut store, MessageKey::local(2), Some(MessageKey::local(1)));
        insert(&mut store, MessageKey::local(3), Some(MessageKey::local(2)));
        store
            .set_active_child(MessageKey::local(1), Some(MessageKey::local(2)))
            .expect("point 1");
        store
            .set_active_child(MessageKey::local(2), Some(MessageKey::local(3)))
            .expect("point 2");
        store
    }

    #[test]
    fn resolution_is_deterministic() {
        let store = chain_store();
        let first = resolve_active_thread(&store, MessageKey::local(1));
        let second = resolve_active_thread(&store, MessageKey::local(1));
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                MessageKey::local(1),
                MessageKey::local(2),
                MessageKey::local(3)
            ]
        );
    }

    #[test]
    fn dangling_active_child_stops_without_error() {
        let mut store = chain_store();
        store
            .get_mut(MessageKey::local(2))
            .expect("node present")
            .active_child = Some(MessageKey::local(42));

        let thread = resolve_active_thread(&store, MessageKey::local(1));
        assert_eq!(thread, vec![MessageKey::local(1), MessageKey::local(2)]);
    }

    #[test]
    fn corrupt_cycle_is_bounded_by_store_size() {
        let mut store = chain_store();
        // Simulated corruption: make 2 and 3 each other's parent and child.
        store
            .get_mut(MessageKey::local(3))
            .expect("node present")
            .active_child = Some(MessageKey::local(2));
        store
            .get_mut(MessageKey::local(2))
            .expect("node present")
            .parent = Some(MessageKey::local(3));

        let thread = resolve_active_thread(&store, MessageKey::local(1));
        assert!(thread.len() <= store.len() + 1);
    }

    #[test]
    fn missing_root_yields_empty_thread() {
        let store = MessageStore::new();
        assert!(resolve_active_thread(&store, MessageKey::local(1)).is_empty());
    }
}
