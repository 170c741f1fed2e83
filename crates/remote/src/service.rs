use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use super::error::RemoteResult;
use super::ids::{ConversationId, DocumentId, MessageId};
use super::wire::{
    ConversationCreated, EditConfirmed, EditRequest, SendConfirmed, SendRequest, StreamFrame,
    WireMessage,
};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Connection parameters for the conversation service.
///
/// The timeout applies to request/response calls only; streaming feeds are
/// long-lived by design and must not be cut by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub request_timeout_ms: u64,
}

impl ServiceConfig {
    pub fn new(endpoint: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            api_token: api_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }

    pub fn with_request_timeout_ms(mut self, request_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type FeedWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One event delivered by a streaming feed, tagged with its target node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub assistant_message_id: MessageId,
    pub frame: StreamFrame,
}

/// Receiving half of one assistant streaming feed.
///
/// Dropping the feed (or calling `cancel`) signals the worker to stop reading;
/// frames already delivered stay delivered.
pub struct StreamFeed {
    assistant_message_id: MessageId,
    events: mpsc::UnboundedReceiver<FeedEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl StreamFeed {
    pub(crate) fn new(
        assistant_message_id: MessageId,
        events: mpsc::UnboundedReceiver<FeedEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            assistant_message_id,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn assistant_message_id(&self) -> MessageId {
        self.assistant_message_id
    }

    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for StreamFeed {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A feed plus the transport read loop that fills it; the caller spawns the
/// worker on its own runtime.
pub struct StreamHandle {
    pub feed: StreamFeed,
    pub worker: FeedWorker,
}

pub trait ConversationService: Send + Sync {
    fn create_conversation(
        &self,
        document_id: Option<DocumentId>,
    ) -> BoxFuture<'_, RemoteResult<ConversationCreated>>;

    fn fetch_tree(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, RemoteResult<Vec<WireMessage>>>;

    fn send_message(&self, request: SendRequest) -> BoxFuture<'_, RemoteResult<SendConfirmed>>;

    fn edit_message(&self, request: EditRequest) -> BoxFuture<'_, RemoteResult<EditConfirmed>>;

    fn open_stream(
        &self,
        conversation_id: ConversationId,
        assistant_message_id: MessageId,
    ) -> RemoteResult<StreamHandle>;
}

pub(crate) fn make_stream_feed(
    assistant_message_id: MessageId,
) -> (
    mpsc::UnboundedSender<FeedEvent>,
    StreamFeed,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        StreamFeed::new(assistant_message_id, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_config_normalizes_endpoint_and_token() {
        let config = ServiceConfig::new(" https://folio.example/api/ ", Some("  ".to_string()));
        assert_eq!(config.endpoint, "https://folio.example/api");
        assert_eq!(config.api_token, None);

        let with_token = ServiceConfig::new("https://folio.example", Some(" tok ".to_string()));
        assert_eq!(with_token.api_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn dropping_feed_signals_cancel() {
        let assistant = MessageId::new_v7();
        let (event_tx, feed, mut cancel_rx) = make_stream_feed(assistant);

        event_tx
            .send(FeedEvent {
                assistant_message_id: assistant,
                frame: StreamFrame::Done,
            })
            .expect("queue event");

        drop(feed);
        cancel_rx
            .try_recv()
            .expect("cancel should fire when the feed is dropped");
    }
}
