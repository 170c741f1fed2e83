pub mod client;
pub mod error;
pub mod ids;
pub mod message;
pub mod session;
pub mod settings;
pub mod store;
pub mod stream;
pub mod thread;
pub mod tree;

pub use client::ChatClient;
pub use error::{ChatError, ChatResult};
pub use ids::{LocalMessageId, MessageKey, StreamSessionId};
pub use message::{MessageNode, MessageStatus, MessageView, Role};
pub use session::{ConversationSession, ExchangeKind, ExchangeRequest, PendingExchange};
pub use settings::{RemoteSettings, SettingsError, SettingsStore};
pub use store::MessageStore;
pub use stream::{StreamBinding, StreamPhase, StreamRejection, StreamTransition};
pub use thread::resolve_active_thread;
pub use tree::MessageTree;
