pub mod error;
pub mod http;
pub mod ids;
pub mod scripted;
pub mod service;
pub mod wire;

pub use error::{RemoteError, RemoteResult};
pub use http::HttpConversationService;
pub use ids::{ConversationId, DocumentId, MessageId};
pub use scripted::ScriptedConversationService;
pub use service::{
    BoxFuture, ConversationService, DEFAULT_REQUEST_TIMEOUT_MS, FeedEvent, FeedWorker,
    ServiceConfig, StreamFeed, StreamHandle,
};
pub use wire::{
    BlockContext, ConversationCreated, EditConfirmed, EditRequest, SendConfirmed, SendRequest,
    StreamFrame, WireMessage, WireRole,
};
