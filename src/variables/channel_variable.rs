//! Channel variables read and written by call sessions.

/// Error returned when parsing an unrecognized channel variable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChannelVariableError(pub String);

impl std::fmt::Display for ParseChannelVariableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown channel variable: {}", self.0)
    }
}

impl std::error::Error for ParseChannelVariableError {}

define_wire_enum! {
    error_type: ParseChannelVariableError,
    /// Channel variable names (the part after the `variable_` prefix).
    ///
    /// Use with [`Event::variable()`](crate::Event::variable) to read them from
    /// channel data, or with `uuid_getvar`/`set`/`unset` at runtime.
    pub enum ChannelVariable {
        /// Set by the originating side; takes precedence over the answer URL.
        TransferUrl => "restxml_transfer_url",
        AnswerUrl => "restxml_answer_url",
        HangupUrl => "restxml_hangup_url",
        SchedHangupId => "restxml_sched_hangup_id",
        RequestUuid => "restxml_request_uuid",
        /// `true` while a transfer owns the channel.
        TransferProgress => "restxml_transfer_progress",
        /// Marks the channel as driven by this application.
        App => "restxml_app",
        HangupAfterBridge => "hangup_after_bridge",
    }
}
