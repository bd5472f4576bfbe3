//! Typed event header names used by the engine and call sessions.

/// Error returned when parsing an unrecognized event header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventHeaderError(pub String);

impl std::fmt::Display for ParseEventHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event header: {}", self.0)
    }
}

impl std::error::Error for ParseEventHeaderError {}

define_wire_enum! {
    error_type: ParseEventHeaderError,
    /// Header names read from channel data and session events.
    ///
    /// Protocol framing headers (`Content-Type`, `Content-Length`,
    /// `Reply-Text`) stay plain constants in [`crate::constants`].
    pub enum EventHeader {
        EventName => "Event-Name",
        EventSubclass => "Event-Subclass",
        UniqueId => "Unique-ID",
        CallerUniqueId => "Caller-Unique-ID",
        JobUuid => "Job-UUID",
        ChannelName => "Channel-Name",
        CallDirection => "Call-Direction",
        HangupCause => "Hangup-Cause",
        Application => "Application",
        ApplicationData => "Application-Data",
        Action => "Action",
        MemberId => "Member-ID",
        CallerCallerIdNumber => "Caller-Caller-ID-Number",
        CallerDestinationNumber => "Caller-Destination-Number",
    }
}
