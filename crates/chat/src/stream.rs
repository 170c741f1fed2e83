use super::ids::{MessageKey, StreamSessionId};

/// Routing key binding one live stream to one target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamBinding {
    pub node: MessageKey,
    pub session: StreamSessionId,
}

impl StreamBinding {
    /// Builds a full stream binding from target node and session IDs.
    pub const fn new(node: MessageKey, session: StreamSessionId) -> Self {
        Self { node, session }
    }
}

/// Stream lifecycle for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming(StreamBinding),
    Done(StreamBinding),
    Error {
        binding: StreamBinding,
        message: String,
    },
    Cancelled(StreamBinding),
}

/// State transition input for the stream lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamBinding),
    Complete(StreamBinding),
    Fail {
        binding: StreamBinding,
        message: String,
    },
    Cancel(StreamBinding),
    ResetToIdle,
}

/// Rejection reason for illegal stream transitions.
///
/// `BindingMismatch` is the protocol-violation case: content arriving for a
/// node other than the one currently streaming, including nodes already
/// marked final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRejection {
    AlreadyStreaming {
        active: StreamBinding,
        attempted: StreamBinding,
    },
    NotStreaming,
    BindingMismatch {
        active: StreamBinding,
        attempted: StreamBinding,
    },
}

/// Result type for stream transition application.
pub type StreamTransitionResult = Result<StreamPhase, StreamRejection>;

impl StreamPhase {
    /// Returns the live binding if and only if the phase is `Streaming`.
    pub fn active_binding(&self) -> Option<StreamBinding> {
        match self {
            Self::Streaming(binding) => Some(*binding),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => None,
        }
    }

    /// True when incoming stream data matches the live binding exactly.
    pub fn accepts(&self, binding: StreamBinding) -> bool {
        matches!(self, Self::Streaming(active) if *active == binding)
    }

    /// Applies one transition deterministically.
    ///
    /// Non-streaming phases may start a new session directly. Any terminal
    /// transition (`Complete`/`Fail`/`Cancel`) must match the live binding
    /// exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(binding) => self.apply_start(binding),
            StreamTransition::Complete(binding) => self.apply_complete(binding),
            StreamTransition::Fail { binding, message } => self.apply_fail(binding, message),
            StreamTransition::Cancel(binding) => self.apply_cancel(binding),
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, binding: StreamBinding) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active != binding => {
                Err(StreamRejection::AlreadyStreaming {
                    active: *active,
                    attempted: binding,
                })
            }
            Self::Streaming(_) => Ok(self.clone()),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Ok(Self::Streaming(binding))
            }
        }
    }

    fn apply_complete(&self, binding: StreamBinding) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == binding => Ok(Self::Done(binding)),
            Self::Streaming(active) => Err(StreamRejection::BindingMismatch {
                active: *active,
                attempted: binding,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(StreamRejection::NotStreaming)
            }
        }
    }

    fn apply_fail(&self, binding: StreamBinding, message: String) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == binding => Ok(Self::Error { binding, message }),
            Self::Streaming(active) => Err(StreamRejection::BindingMismatch {
                active: *active,
                attempted: binding,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(StreamRejection::NotStreaming)
            }
        }
    }

    fn apply_cancel(&self, binding: StreamBinding) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == binding => Ok(Self::Cancelled(binding)),
            Self::Streaming(active) => Err(StreamRejection::BindingMismatch {
                active: *active,
                attempted: binding,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(StreamRejection::NotStreaming)
            }
        }
    }
}
