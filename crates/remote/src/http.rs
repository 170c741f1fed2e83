use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};

use super::error::{
    BuildHttpClientSnafu, DecodePayloadSnafu, HttpSnafu, RemoteResult, UnexpectedStatusSnafu,
};
use super::ids::{ConversationId, DocumentId, MessageId};
use super::service::{
    BoxFuture, ConversationService, FeedEvent, FeedWorker, ServiceConfig, StreamHandle,
    make_stream_feed,
};
use super::wire::{
    ConversationCreated, EditConfirmed, EditRequest, SendConfirmed, SendRequest, StreamFrame,
    WireMessage,
};

/// Reqwest-backed client for the conversation service.
///
/// Request/response calls are plain JSON; the streaming feed is a long-lived
/// GET whose body carries one `data: {...}` frame per line.
pub struct HttpConversationService {
    config: ServiceConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateConversationBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<DocumentId>,
}

impl HttpConversationService {
    pub fn new(config: ServiceConfig) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildHttpClientSnafu {
                stage: "build-http-client",
                endpoint: config.endpoint.clone(),
            })?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint, path)
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
        stage: &'static str,
    ) -> RemoteResult<T> {
        let status = response.status();
        let body = response.text().await.context(HttpSnafu { stage })?;

        if !status.is_success() {
            return UnexpectedStatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        serde_json::from_str(&body).context(DecodePayloadSnafu { stage })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        stage: &'static str,
    ) -> RemoteResult<T> {
        let response = self
            .apply_auth(self.client.get(self.url(path)))
            .timeout(self.request_timeout())
            .send()
            .await
            .context(HttpSnafu { stage })?;

        Self::read_json(response, stage).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        stage: &'static str,
    ) -> RemoteResult<T> {
        let response = self
            .apply_auth(self.client.post(self.url(path)))
            .timeout(self.request_timeout())
            .json(body)
            .send()
            .await
            .context(HttpSnafu { stage })?;

        Self::read_json(response, stage).await
    }

    /// Extracts one stream frame from a feed line, if the line carries one.
    fn parse_feed_line(line: &str) -> Option<StreamFrame> {
        let payload = line.trim().strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }

        match serde_json::from_str(payload) {
            Ok(frame) => Some(frame),
            Err(error) => {
                tracing::warn!(error = %error, line = %payload, "skipping unparseable feed line");
                None
            }
        }
    }

    /// Parses every complete line out of the buffer, keeping the trailing
    /// partial line for the next chunk.
    fn drain_feed_buffer(buffer: &mut String) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        let mut last_newline_pos = 0;

        for (idx, _) in buffer.match_indices('\n') {
            let line = &buffer[last_newline_pos..idx];
            last_newline_pos = idx + 1;

            if let Some(frame) = Self::parse_feed_line(line) {
                frames.push(frame);
            }
        }

        *buffer = buffer[last_newline_pos..].to_string();
        frames
    }

    async fn run_feed_worker(
        client: reqwest::Client,
        url: String,
        api_token: Option<String>,
        assistant_message_id: MessageId,
        event_tx: mpsc::UnboundedSender<FeedEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut request = client.get(&url);
        if let Some(token) = &api_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    assistant_message_id = %assistant_message_id,
                    error = %error,
                    "failed to open streaming feed"
                );
                Self::emit_error(&event_tx, assistant_message_id, error.to_string());
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            Self::emit_error(
                &event_tx,
                assistant_message_id,
                format!("feed returned status {}: {body}", status.as_u16()),
            );
            return;
        }

        let mut chunks = response.bytes_stream();
        let mut buffer = String::new();
        let mut terminal_seen = false;
        let mut cancelled = false;

        'read: loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(assistant_message_id = %assistant_message_id, "streaming feed cancelled");
                    break;
                }
                next_chunk = chunks.next() => {
                    match next_chunk {
                        Some(Ok(chunk)) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                            for frame in Self::drain_feed_buffer(&mut buffer) {
                                let is_terminal = frame.is_terminal();
                                if event_tx
                                    .send(FeedEvent { assistant_message_id, frame })
                                    .is_err()
                                {
                                    return;
                                }
                                if is_terminal {
                                    terminal_seen = true;
                                    break 'read;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                assistant_message_id = %assistant_message_id,
                                error = %source,
                                "streaming feed failed mid-read"
                            );
                            Self::emit_error(&event_tx, assistant_message_id, source.to_string());
                            terminal_seen = true;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        // A connection that closes without `done` is a failure, not a finish.
        if !cancelled && !terminal_seen {
            Self::emit_error(
                &event_tx,
                assistant_message_id,
                "feed ended before a terminal frame".to_string(),
            );
        }
    }

    fn emit_error(
        event_tx: &mpsc::UnboundedSender<FeedEvent>,
        assistant_message_id: MessageId,
        message: String,
    ) {
        let _ = event_tx.send(FeedEvent {
            assistant_message_id,
            frame: StreamFrame::Error { message },
        });
    }
}

impl ConversationService for HttpConversationService {
    fn create_conversation(
        &self,
        document_id: Option<DocumentId>,
    ) -> BoxFuture<'_, RemoteResult<ConversationCreated>> {
        Box::pin(async move {
            self.post_json(
                "/conversations",
                &CreateConversationBody { document_id },
                "create-conversation",
            )
            .await
        })
    }

    fn fetch_tree(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, RemoteResult<Vec<WireMessage>>> {
        Box::pin(async move {
            self.get_json(&format!("/conversations/{conversation_id}/tree"), "fetch-tree")
                .await
        })
    }

    fn send_message(&self, request: SendRequest) -> BoxFuture<'_, RemoteResult<SendConfirmed>> {
        Box::pin(async move {
            self.post_json(
                &format!("/conversations/{}/messages", request.conversation_id),
                &request,
                "send-message",
            )
            .await
        })
    }

    fn edit_message(&self, request: EditRequest) -> BoxFuture<'_, RemoteResult<EditConfirmed>> {
        Box::pin(async move {
            self.post_json(
                &format!(
                    "/conversations/{}/messages/{}/edit",
                    request.conversation_id, request.message_id
                ),
                &request,
                "edit-message",
            )
            .await
        })
    }

    fn open_stream(
        &self,
        conversation_id: ConversationId,
        assistant_message_id: MessageId,
    ) -> RemoteResult<StreamHandle> {
        let url = self.url(&format!(
            "/conversations/{conversation_id}/streams/{assistant_message_id}"
        ));
        let (event_tx, feed, cancel_rx) = make_stream_feed(assistant_message_id);
        let worker: FeedWorker = Box::pin(Self::run_feed_worker(
            self.client.clone(),
            url,
            self.config.api_token.clone(),
            assistant_message_id,
            event_tx,
            cancel_rx,
        ));

        Ok(StreamHandle { feed, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_line_requires_data_prefix() {
        assert_eq!(
            HttpConversationService::parse_feed_line("data: {\"type\":\"done\"}"),
            Some(StreamFrame::Done)
        );
        assert_eq!(HttpConversationService::parse_feed_line(": keepalive"), None);
        assert_eq!(HttpConversationService::parse_feed_line(""), None);
        assert_eq!(HttpConversationService::parse_feed_line("data:"), None);
    }

    #[test]
    fn unparseable_feed_line_is_skipped() {
        assert_eq!(
            HttpConversationService::parse_feed_line("data: {malformed"),
            None
        );
    }

    #[test]
    fn buffer_drain_handles_frames_split_across_chunks() {
        let mut buffer = String::new();

        buffer.push_str("data: {\"type\":\"delta\",\"te");
        assert!(HttpConversationService::drain_feed_buffer(&mut buffer).is_empty());

        buffer.push_str("xt\":\"Hel\"}\ndata: {\"type\":\"delta\",\"text\":\"lo\"}\n");
        let frames = HttpConversationService::drain_feed_buffer(&mut buffer);
        assert_eq!(
            frames,
            vec![
                StreamFrame::Delta {
                    text: "Hel".to_string()
                },
                StreamFrame::Delta {
                    text: "lo".to_string()
                },
            ]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_drain_keeps_trailing_partial_line() {
        let mut buffer = "data: {\"type\":\"done\"}\ndata: {\"type\":\"del".to_string();
        let frames = HttpConversationService::drain_feed_buffer(&mut buffer);
        assert_eq!(frames, vec![StreamFrame::Done]);
        assert_eq!(buffer, "data: {\"type\":\"del");
    }
}
