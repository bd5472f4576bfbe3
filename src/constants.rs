//! Protocol constants and configuration defaults

/// Default address the outbound server listens on for FreeSWITCH `socket` connections.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8084";

/// Line terminator used by the event socket protocol.
pub const EOL: &str = "\n";

/// Terminator appended to simple commands (`<verb> <args>` + blank line).
pub const COMMAND_TERMINATOR: &str = "\n\n";

/// Maximum header lines read for one event before the peer is considered hostile.
pub const MAX_LINES_PER_EVENT: usize = 1000;

/// Maximum fetch/execute iterations per call (redirect ceiling).
pub const MAX_REDIRECT: usize = 1000;

/// Default number of concurrently running event handlers per connection (0 = unbounded).
pub const DEFAULT_HANDLER_POOL_SIZE: usize = 0;

/// Default HTTP timeout for document fetches and hangup notifications.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_TEXT_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Protocol framing header: body type.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";

/// JSON event key carrying the event body.
pub const JSON_BODY_KEY: &str = "_body";

/// Events each call session subscribes to after `connect`.
pub const SESSION_EVENT_FILTER: &str =
    "CHANNEL_EXECUTE_COMPLETE CHANNEL_HANGUP CUSTOM conference::maintenance";

/// `Event-Subclass` of conference membership events.
pub const CONFERENCE_MAINTENANCE_SUBCLASS: &str = "conference::maintenance";
