//! Error types for the event socket engine and call sessions

/// Result alias for protocol engine operations.
pub type EslResult<T> = Result<T, EslError>;

/// Result alias for call session operations.
pub type CallResult<T> = Result<T, CallError>;

/// Errors raised by the event socket protocol engine.
///
/// `FramingLimit`, `ConnectionClosed` and `Io` leave the connection unusable;
/// the background reader stops on any of them.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EslError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the socket (EOF mid-header or mid-body).
    #[error("connection closed")]
    ConnectionClosed,

    /// A header block exceeded the per-event line cap.
    #[error("max lines per event ({limit}) reached")]
    FramingLimit { limit: usize },

    /// Command issued on a connection that is no longer connected.
    #[error("not connected")]
    NotConnected,

    /// Malformed input on either side of the wire.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A `text/event-json` body was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The outbound `connect` handshake was refused.
    #[error("connect failed: {reply_text}")]
    ConnectFailed { reply_text: String },
}

impl EslError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        EslError::ProtocolError {
            message: message.into(),
        }
    }

    pub(crate) fn framing_limit(limit: usize) -> Self {
        EslError::FramingLimit { limit }
    }

    /// `true` for errors after which the socket must not be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EslError::Io(_) | EslError::ConnectionClosed | EslError::FramingLimit { .. }
        )
    }
}

/// Call-flow document rejections. None of them leave partial execution behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RestXmlError {
    /// The document is not well-formed XML.
    #[error("invalid RESTXML syntax: {0}")]
    Syntax(String),

    /// Wrong root tag, or disallowed nesting.
    #[error("invalid RESTXML format: {0}")]
    Format(String),

    /// A tag with no entry in the element registry.
    #[error("unrecognized element: {0}")]
    UnrecognizedElement(String),
}

/// Errors surfaced while a call session drives the channel.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CallError {
    /// The channel hung up before or during the current operation.
    #[error("channel has hung up")]
    HungUp,

    /// The event socket connection failed.
    #[error(transparent)]
    Esl(#[from] EslError),

    /// The fetched document was rejected.
    #[error(transparent)]
    Document(#[from] RestXmlError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(EslError::ConnectionClosed.is_fatal());
        assert!(EslError::framing_limit(10).is_fatal());
        assert!(!EslError::NotConnected.is_fatal());
        assert!(!EslError::protocol_error("x").is_fatal());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            EslError::framing_limit(1000).to_string(),
            "max lines per event (1000) reached"
        );
        assert_eq!(
            RestXmlError::UnrecognizedElement("Foo".into()).to_string(),
            "unrecognized element: Foo"
        );
        let err: CallError = RestXmlError::Format("No Response Tag Present".into()).into();
        assert_eq!(
            err.to_string(),
            "invalid RESTXML format: No Response Tag Present"
        );
    }
}
