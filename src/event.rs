//! Event model: ordered headers plus an optional body

use crate::channel::CallDirection;
use crate::constants::{
    CONTENT_TYPE_TEXT_EVENT_JSON, CONTENT_TYPE_TEXT_EVENT_PLAIN, HEADER_CONTENT_LENGTH,
    HEADER_CONTENT_TYPE,
};
use crate::headers::EventHeader;
use crate::variables::ChannelVariable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Event encoding requested with `event <format> ...`.
///
/// One format per connection; events in the other format are treated as
/// unknown content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFormat {
    /// `text/event-plain`
    Plain,
    /// `text/event-json`
    #[default]
    Json,
}

impl EventFormat {
    /// Content type FreeSWITCH uses for events in this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            EventFormat::Plain => CONTENT_TYPE_TEXT_EVENT_PLAIN,
            EventFormat::Json => CONTENT_TYPE_TEXT_EVENT_JSON,
        }
    }
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFormat::Plain => write!(f, "plain"),
            EventFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for EventFormat {
    type Err = ParseEventFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s
            .to_ascii_lowercase()
            .as_str()
        {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => Err(ParseEventFormatError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid event format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventFormatError(pub String);

impl fmt::Display for ParseEventFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event format: {}", self.0)
    }
}

impl std::error::Error for ParseEventFormatError {}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

define_wire_enum! {
    error_type: ParseEventTypeError,
    /// FreeSWITCH event names a handler registry can be keyed on.
    ///
    /// Names outside this set still dispatch, to the registry fallback.
    pub enum EslEventType {
        Custom => "CUSTOM",
        ChannelCreate => "CHANNEL_CREATE",
        ChannelDestroy => "CHANNEL_DESTROY",
        ChannelState => "CHANNEL_STATE",
        ChannelCallstate => "CHANNEL_CALLSTATE",
        ChannelAnswer => "CHANNEL_ANSWER",
        ChannelHangup => "CHANNEL_HANGUP",
        ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
        ChannelExecute => "CHANNEL_EXECUTE",
        ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
        ChannelBridge => "CHANNEL_BRIDGE",
        ChannelUnbridge => "CHANNEL_UNBRIDGE",
        ChannelProgress => "CHANNEL_PROGRESS",
        ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
        ChannelOutgoing => "CHANNEL_OUTGOING",
        ChannelPark => "CHANNEL_PARK",
        ChannelUnpark => "CHANNEL_UNPARK",
        ChannelOriginate => "CHANNEL_ORIGINATE",
        ChannelData => "CHANNEL_DATA",
        Api => "API",
        BackgroundJob => "BACKGROUND_JOB",
        Dtmf => "DTMF",
        DetectedSpeech => "DETECTED_SPEECH",
        RecordStart => "RECORD_START",
        RecordStop => "RECORD_STOP",
        PlaybackStart => "PLAYBACK_START",
        PlaybackStop => "PLAYBACK_STOP",
        Heartbeat => "HEARTBEAT",
        SessionHeartbeat => "SESSION_HEARTBEAT",
        Shutdown => "SHUTDOWN",
    }
}

impl EslEventType {
    /// Parse event type from wire name (case-insensitive).
    pub fn parse_event_type(s: &str) -> Option<Self> {
        s.parse()
            .ok()
    }
}

/// Event (or reply) made of ordered headers and an optional body.
///
/// Headers keep arrival order. Setting an existing key replaces the value in
/// place; the key keeps the position of its first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl Event {
    /// Create a new empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a header by name (case-sensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a header by its typed name.
    pub fn typed_header(&self, name: EventHeader) -> Option<&str> {
        self.header(name.as_str())
    }

    /// Headers in arrival order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of distinct header keys.
    pub fn header_count(&self) -> usize {
        self.headers
            .len()
    }

    /// Set or overwrite a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| *k == name)
        {
            Some(slot) => slot.1 = value,
            None => self
                .headers
                .push((name, value)),
        }
    }

    /// Remove a header, returning its value if it existed.
    pub fn del_header(&mut self, name: &str) -> Option<String> {
        let pos = self
            .headers
            .iter()
            .position(|(k, _)| k == name)?;
        Some(
            self.headers
                .remove(pos)
                .1,
        )
    }

    /// Event body as text. `None` when absent or not valid UTF-8.
    pub fn body(&self) -> Option<&str> {
        self.body_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Event body exactly as read off the socket.
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body
            .as_deref()
    }

    /// Attach the body read after the header block.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = Some(body.into());
    }

    /// `true` for the neutral event: no headers and no body.
    pub fn is_empty(&self) -> bool {
        self.headers
            .is_empty()
            && self
                .body
                .is_none()
    }

    /// `Content-Type` header.
    pub fn content_type(&self) -> Option<&str> {
        self.header(HEADER_CONTENT_TYPE)
    }

    /// `Content-Length` header as a byte count. Missing or unparsable is `None`.
    pub fn content_length(&self) -> Option<usize> {
        self.header(HEADER_CONTENT_LENGTH)?
            .trim()
            .parse()
            .ok()
    }

    /// `Event-Name` header.
    pub fn event_name(&self) -> Option<&str> {
        self.typed_header(EventHeader::EventName)
    }

    /// `Event-Name` normalized to a known [`EslEventType`].
    pub fn event_type(&self) -> Option<EslEventType> {
        EslEventType::parse_event_type(self.event_name()?)
    }

    /// Check whether this event matches the given type.
    pub fn is_event_type(&self, event_type: EslEventType) -> bool {
        self.event_type() == Some(event_type)
    }

    /// `Event-Subclass` header for `CUSTOM` events (e.g. `conference::maintenance`).
    pub fn event_subclass(&self) -> Option<&str> {
        self.typed_header(EventHeader::EventSubclass)
    }

    /// `Unique-ID` header, falling back to `Caller-Unique-ID`.
    pub fn unique_id(&self) -> Option<&str> {
        self.typed_header(EventHeader::UniqueId)
            .or_else(|| self.typed_header(EventHeader::CallerUniqueId))
    }

    /// `Hangup-Cause` header (e.g. `NORMAL_CLEARING`, `USER_BUSY`).
    pub fn hangup_cause(&self) -> Option<&str> {
        self.typed_header(EventHeader::HangupCause)
    }

    /// Parse the `Call-Direction` header into a [`CallDirection`].
    pub fn call_direction(&self) -> Option<CallDirection> {
        self.typed_header(EventHeader::CallDirection)?
            .parse()
            .ok()
    }

    /// Look up a channel variable by name through its `variable_{name}` header.
    pub fn variable(&self, name: &str) -> Option<&str> {
        let key = format!("variable_{}", name);
        self.header(&key)
    }

    /// Typed form of [`variable`](Self::variable). Empty values count as unset.
    pub fn channel_variable(&self, var: ChannelVariable) -> Option<&str> {
        self.variable(var.as_str())
            .filter(|v| !v.is_empty())
    }
}
