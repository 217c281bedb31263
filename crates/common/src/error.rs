// Typed errors for decoding push frames and validating domain payloads.

use thiserror::Error;

/// Errors raised while translating between wire frames and typed events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame names an event this client does not understand.
    #[error("unknown push event `{0}`")]
    UnknownEvent(String),

    /// The frame's payload does not match the shape of its event.
    #[error("malformed `{event}` payload: {reason}")]
    MalformedPayload { event: String, reason: String },

    /// A server-sourced notice arrived without an acknowledgeable id.
    #[error("server notice is missing a stable id")]
    MissingNoticeId,
}

impl ProtocolError {
    pub(crate) fn malformed(event: &str, reason: impl ToString) -> Self {
        Self::MalformedPayload { event: event.to_string(), reason: reason.to_string() }
    }
}
