use std::fmt;

use folio_remote::MessageId;

/// Locally minted identity for a provisional message awaiting server
/// confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalMessageId(pub u64);

impl LocalMessageId {
    /// Creates a typed local message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for LocalMessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "local-{}", self.0)
    }
}

/// Identifier for one streaming generation session.
///
/// This must change on every exchange so stale frames can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    /// Creates a typed stream session identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Message identity: a provisional local id or a server-confirmed id.
///
/// Keeping the two cases structurally distinct means reconciliation can never
/// confuse a provisional node for a confirmed one by string convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Local(LocalMessageId),
    Remote(MessageId),
}

impl MessageKey {
    pub const fn local(raw: u64) -> Self {
        Self::Local(LocalMessageId::new(raw))
    }

    pub fn remote(id: MessageId) -> Self {
        Self::Remote(id)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Server-confirmed identity, if this key has one.
    pub fn as_remote(&self) -> Option<MessageId> {
        match self {
            Self::Local(_) => None,
            Self::Remote(id) => Some(*id),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(formatter, "{id}"),
            Self::Remote(id) => write!(formatter, "{id}"),
        }
    }
}

impl From<MessageId> for MessageKey {
    fn from(value: MessageId) -> Self {
        Self::Remote(value)
    }
}

impl From<LocalMessageId> for MessageKey {
    fn from(value: LocalMessageId) -> Self {
        Self::Local(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_and_remote_keys_never_compare_equal() {
        let local = MessageKey::local(7);
        let remote = MessageKey::remote(MessageId::new_v7());
        assert_ne!(local, remote);
        assert!(local.is_local());
        assert!(local.as_remote().is_none());
        assert!(remote.as_remote().is_some());
    }
}
