use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

/// Chat speaker role as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireRole {
    System,
    User,
    Assistant,
}

/// One flat history element returned by `fetch_tree`.
///
/// `parent_id` is absent only for the conversation root; `active_child_id`
/// encodes which continuation the server last considered selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: MessageId,
    pub role: WireRole,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub active_child_id: Option<MessageId>,
    pub created_at_unix_seconds: u64,
}

impl WireMessage {
    pub fn new(
        id: MessageId,
        role: WireRole,
        content: impl Into<String>,
        created_at_unix_seconds: u64,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            parent_id: None,
            active_child_id: None,
            created_at_unix_seconds,
        }
    }

    pub fn with_parent(mut self, parent_id: MessageId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_active_child(mut self, active_child_id: MessageId) -> Self {
        self.active_child_id = Some(active_child_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCreated {
    pub conversation_id: ConversationId,
    pub root_message_id: MessageId,
}

/// Document-block anchor attached to a send, tying a chat turn to the
/// passage the reader was looking at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub block_id: String,
    #[serde(default)]
    pub quote: Option<String>,
}

impl BlockContext {
    pub fn new(block_id: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            quote: None,
        }
    }

    pub fn with_quote(mut self, quote: impl Into<String>) -> Self {
        self.quote = Some(quote.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    pub parent_id: MessageId,
    pub active_thread_ids: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_context: Option<BlockContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendConfirmed {
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub content: String,
    pub active_thread_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditConfirmed {
    pub edited_message_id: MessageId,
    pub assistant_message_id: MessageId,
}

/// One frame of the assistant streaming feed.
///
/// A clean end-of-stream (`Done`) is distinct from a transport failure
/// (`Error` frame or abnormal close), so the reconciler can dispatch
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Delta { text: String },
    Done,
    Error { message: String },
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frame_serde_roundtrips_every_variant() {
        let frames = vec![
            StreamFrame::Delta {
                text: "Hel".to_string(),
            },
            StreamFrame::Done,
            StreamFrame::Error {
                message: "feed reset".to_string(),
            },
        ];

        for frame in frames {
            let encoded = serde_json::to_string(&frame).expect("serialize frame");
            let decoded: StreamFrame = serde_json::from_str(&encoded).expect("deserialize frame");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn stream_frame_uses_type_tag() {
        let encoded = serde_json::to_string(&StreamFrame::Done).expect("serialize done");
        assert_eq!(encoded, "{\"type\":\"done\"}");

        let delta: StreamFrame =
            serde_json::from_str("{\"type\":\"delta\",\"text\":\"hi\"}").expect("parse delta");
        assert_eq!(
            delta,
            StreamFrame::Delta {
                text: "hi".to_string()
            }
        );
    }

    #[test]
    fn wire_message_tolerates_missing_optional_fields() {
        let id = MessageId::new_v7();
        let raw = format!(
            "{{\"id\":\"{id}\",\"role\":\"system\",\"content\":\"\",\"created_at_unix_seconds\":1700000000}}"
        );
        let decoded: WireMessage = serde_json::from_str(&raw).expect("parse without options");
        assert_eq!(decoded.parent_id, None);
        assert_eq!(decoded.active_child_id, None);
        assert_eq!(decoded.role, WireRole::System);
    }

    #[test]
    fn send_request_omits_empty_block_context() {
        let request = SendRequest {
            conversation_id: ConversationId::new_v7(),
            content: "hi".to_string(),
            parent_id: MessageId::new_v7(),
            active_thread_ids: vec![MessageId::new_v7()],
            block_context: None,
        };

        let encoded = serde_json::to_string(&request).expect("serialize send request");
        assert!(!encoded.contains("block_context"));
    }
}
