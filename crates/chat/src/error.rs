use snafu::Snafu;

use folio_remote::RemoteError;

use super::ids::MessageKey;
use super::stream::StreamRejection;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("conversation has no root message"))]
    MissingRoot { stage: &'static str },
    #[snafu(display("message {key} is not in the store"))]
    UnknownMessage { stage: &'static str, key: MessageKey },
    #[snafu(display("message {key} already exists in the store"))]
    DuplicateMessage { stage: &'static str, key: MessageKey },
    #[snafu(display("message {key} references missing parent {parent}"))]
    DanglingParent {
        stage: &'static str,
        key: MessageKey,
        parent: MessageKey,
    },
    #[snafu(display("{child} is not a child of {parent}"))]
    InvalidActiveChild {
        stage: &'static str,
        parent: MessageKey,
        child: MessageKey,
    },
    #[snafu(display("the conversation root cannot be edited or switched"))]
    RootIsImmovable { stage: &'static str, key: MessageKey },
    #[snafu(display("only user messages can be edited, {key} is not one"))]
    EditTargetNotUser { stage: &'static str, key: MessageKey },
    #[snafu(display("operation requires a server-confirmed message, {key} is provisional"))]
    ProvisionalAnchor { stage: &'static str, key: MessageKey },
    #[snafu(display("another send/edit is still in flight"))]
    MutationInFlight { stage: &'static str },
    #[snafu(display("no exchange is awaiting confirmation"))]
    NoPendingExchange { stage: &'static str },
    #[snafu(display("a live stream is targeting {key}; finish or cancel it first"))]
    StreamBusy { stage: &'static str, key: MessageKey },
    #[snafu(display("stream transition rejected: {rejection:?}"))]
    StreamRejected {
        stage: &'static str,
        rejection: StreamRejection,
    },
    #[snafu(display("conversation service call failed on `{stage}`, {source}"))]
    Remote {
        stage: &'static str,
        source: RemoteError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
