//! Command serialization and reply classification

use crate::{
    constants::{COMMAND_TERMINATOR, EOL, HEADER_REPLY_TEXT},
    error::{EslError, EslResult},
    event::{Event, EventFormat},
    headers::EventHeader,
};
use std::fmt;

/// Validate that a user-provided string contains no newline characters.
///
/// Commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::ProtocolError {
            message: format!("{} must not contain newlines", context),
        });
    }
    Ok(())
}

/// Which view a reply is read through. Decided by the verb that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// `command/reply` to any verb other than `api`/`bgapi`, and every `sendmsg`.
    Command,
    /// `api/response`; the result is the body.
    Api,
    /// `command/reply` to `bgapi`, carrying the job id.
    Bgapi,
}

impl ResponseKind {
    /// Kind of reply produced by `verb`.
    pub fn for_verb(verb: &str) -> Self {
        match verb {
            "api" => ResponseKind::Api,
            "bgapi" => ResponseKind::Bgapi,
            _ => ResponseKind::Command,
        }
    }
}

/// Reply to a command, viewed according to the verb that produced it.
///
/// The neutral response (empty event) is returned when the connection is
/// closing or torn down while waiting; it is never successful.
#[derive(Debug, Clone, PartialEq)]
pub struct EslResponse {
    kind: ResponseKind,
    event: Event,
}

impl EslResponse {
    /// Wrap a reply event.
    pub fn new(kind: ResponseKind, event: Event) -> Self {
        Self { kind, event }
    }

    /// Empty response of the given kind.
    pub fn neutral(kind: ResponseKind) -> Self {
        Self::new(kind, Event::default())
    }

    /// View this response is read through.
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// `true` when no reply was received.
    pub fn is_neutral(&self) -> bool {
        self.event
            .is_empty()
    }

    /// Underlying reply event.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Consume into the underlying reply event.
    pub fn into_event(self) -> Event {
        self.event
    }

    /// `api` succeeds when the body starts with `+OK`; everything else when
    /// `Reply-Text` does.
    pub fn is_success(&self) -> bool {
        let text = match self.kind {
            ResponseKind::Api => self.body(),
            ResponseKind::Command | ResponseKind::Bgapi => self.reply_text(),
        };
        text.is_some_and(|t| t.starts_with("+OK"))
    }

    /// Raw `Reply-Text` header value (e.g. `+OK`, `-ERR invalid command`).
    pub fn reply_text(&self) -> Option<&str> {
        self.event
            .header(HEADER_REPLY_TEXT)
    }

    /// Reply body; the command output for `api`.
    pub fn body(&self) -> Option<&str> {
        self.event
            .body()
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.event
            .body_bytes()
    }

    /// Look up a reply header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.event
            .header(name)
    }

    /// `Job-UUID` of a `bgapi` reply.
    ///
    /// Read from the dedicated header, falling back to the
    /// `+OK Job-UUID: <uuid>` form of `Reply-Text`.
    pub fn job_uuid(&self) -> Option<&str> {
        self.event
            .typed_header(EventHeader::JobUuid)
            .or_else(|| {
                self.reply_text()?
                    .strip_prefix("+OK Job-UUID:")
                    .map(str::trim)
            })
    }
}

/// Simple `<verb> <args>` commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EslCommand {
    /// Outbound handshake; the reply carries the channel data.
    Connect,
    /// Execute API command and wait for its output.
    Api { command: String },
    /// Execute API command in the background.
    BgApi { command: String },
    /// Subscribe to events.
    Event { format: EventFormat, events: String },
    /// Subscribe to this channel's events only.
    MyEvents,
    /// Only deliver events whose `header` equals `value`.
    Filter { header: String, value: String },
    /// Keep socket open after channel hangup.
    Linger,
    /// Cancel linger mode.
    NoLinger,
    /// Resume dialplan execution on socket disconnect.
    Resume,
    /// Close the socket from the switch side.
    Exit,
}

impl EslCommand {
    /// Protocol verb.
    pub fn verb(&self) -> &'static str {
        match self {
            EslCommand::Connect => "connect",
            EslCommand::Api { .. } => "api",
            EslCommand::BgApi { .. } => "bgapi",
            EslCommand::Event { .. } => "event",
            EslCommand::MyEvents => "myevents",
            EslCommand::Filter { .. } => "filter",
            EslCommand::Linger => "linger",
            EslCommand::NoLinger => "nolinger",
            EslCommand::Resume => "resume",
            EslCommand::Exit => "exit",
        }
    }

    /// Argument string following the verb (empty for bare verbs).
    pub fn args(&self) -> String {
        match self {
            EslCommand::Api { command } | EslCommand::BgApi { command } => command.clone(),
            EslCommand::Event { format, events } => format!("{} {}", format, events),
            EslCommand::Filter { header, value } => format!("{} {}", header, value),
            _ => String::new(),
        }
    }

    /// View the reply to this command is read through.
    pub fn response_kind(&self) -> ResponseKind {
        ResponseKind::for_verb(self.verb())
    }

    /// Validate user-supplied fields, then convert to wire format.
    pub fn to_wire_format(&self) -> EslResult<String> {
        format_simple_command(self.verb(), &self.args())
    }
}

impl fmt::Display for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args();
        if args.is_empty() {
            f.write_str(self.verb())
        } else {
            write!(f, "{} {}", self.verb(), args)
        }
    }
}

/// `"<verb> <args>\n\n"`, without the space when `args` is empty.
pub fn format_simple_command(verb: &str, args: &str) -> EslResult<String> {
    validate_no_newlines(verb, "command verb")?;
    validate_no_newlines(args, "command arguments")?;

    let mut result = String::from(verb);
    if !args.is_empty() {
        result.push(' ');
        result.push_str(args);
    }
    result.push_str(COMMAND_TERMINATOR);
    Ok(result)
}

/// Dialplan application executed on a channel through `sendmsg`.
///
/// The argument travels length-delimited, so it may contain newlines.
///
/// ```
/// use freeswitch_restxml::AppCommand;
///
/// let wire = AppCommand::new("playback")
///     .uuid("abc")
///     .arg("/tmp/hello.wav")
///     .event_lock(true)
///     .to_wire_format()
///     .unwrap();
/// assert!(wire.starts_with("sendmsg abc\ncall-command: execute\n"));
/// assert!(wire.contains("event-lock: true\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCommand {
    name: String,
    arg: Option<String>,
    uuid: Option<String>,
    event_lock: bool,
    loops: u32,
}

impl AppCommand {
    /// Execute application `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg: None,
            uuid: None,
            event_lock: false,
            loops: 1,
        }
    }

    /// Application argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }

    /// Target channel. Outbound sockets default to their own channel.
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Queue behind the previous application instead of interrupting it.
    pub fn event_lock(mut self, lock: bool) -> Self {
        self.event_lock = lock;
        self
    }

    /// Repeat the application `loops` times.
    pub fn loops(mut self, loops: u32) -> Self {
        self.loops = loops;
        self
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate and serialize the `sendmsg` block.
    pub fn to_wire_format(&self) -> EslResult<String> {
        use std::fmt::Write;

        validate_no_newlines(&self.name, "application name")?;
        if let Some(uuid) = &self.uuid {
            validate_no_newlines(uuid, "sendmsg uuid")?;
        }

        let mut msg = String::from("sendmsg");
        if let Some(uuid) = self
            .uuid
            .as_deref()
            .filter(|u| !u.is_empty())
        {
            msg.push(' ');
            msg.push_str(uuid);
        }
        msg.push_str(EOL);
        msg.push_str("call-command: execute\n");
        let _ = writeln!(msg, "execute-app-name: {}", self.name);
        if self.event_lock {
            msg.push_str("event-lock: true\n");
        }
        if self.loops > 1 {
            let _ = writeln!(msg, "loops: {}", self.loops);
        }
        if let Some(arg) = self
            .arg
            .as_deref()
            .filter(|a| !a.is_empty())
        {
            let _ = write!(
                msg,
                "content-type: text/plain\ncontent-length: {}\n\n{}\n",
                arg.len(),
                arg
            );
        }
        msg.push_str(EOL);
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> Event {
        let mut event = Event::new();
        event.set_header("Content-Type", "command/reply");
        event.set_header("Reply-Text", text);
        event
    }

    #[test]
    fn test_simple_command_wire_format() {
        assert_eq!(
            EslCommand::Connect
                .to_wire_format()
                .unwrap(),
            "connect\n\n"
        );
        assert_eq!(
            EslCommand::Filter {
                header: "Unique-ID".into(),
                value: "abc".into()
            }
            .to_wire_format()
            .unwrap(),
            "filter Unique-ID abc\n\n"
        );
        assert_eq!(
            EslCommand::Event {
                format: EventFormat::Json,
                events: "CHANNEL_HANGUP CUSTOM conference::maintenance".into()
            }
            .to_wire_format()
            .unwrap(),
            "event json CHANNEL_HANGUP CUSTOM conference::maintenance\n\n"
        );
    }

    #[test]
    fn test_newline_injection_rejected() {
        let err = EslCommand::Api {
            command: "status\n\nexit".into(),
        }
        .to_wire_format()
        .unwrap_err();
        assert!(matches!(err, EslError::ProtocolError { .. }));

        let err = AppCommand::new("playback\r\n")
            .to_wire_format()
            .unwrap_err();
        assert!(matches!(err, EslError::ProtocolError { .. }));
    }

    #[test]
    fn test_sendmsg_without_arg() {
        let wire = AppCommand::new("answer")
            .uuid("uuid-1")
            .to_wire_format()
            .unwrap();
        assert_eq!(
            wire,
            "sendmsg uuid-1\ncall-command: execute\nexecute-app-name: answer\n\n"
        );
    }

    #[test]
    fn test_sendmsg_with_arg_lock_and_loops() {
        let wire = AppCommand::new("playback")
            .uuid("uuid-1")
            .arg("line one\nline two")
            .event_lock(true)
            .loops(3)
            .to_wire_format()
            .unwrap();
        assert_eq!(
            wire,
            "sendmsg uuid-1\ncall-command: execute\nexecute-app-name: playback\n\
             event-lock: true\nloops: 3\ncontent-type: text/plain\ncontent-length: 17\n\n\
             line one\nline two\n\n"
        );
    }

    #[test]
    fn test_sendmsg_single_loop_omitted() {
        let wire = AppCommand::new("sleep")
            .arg("1000")
            .loops(1)
            .to_wire_format()
            .unwrap();
        assert!(!wire.contains("loops:"));
        assert!(wire.starts_with("sendmsg\n"));
    }

    #[test]
    fn test_command_success() {
        let ok = EslResponse::new(ResponseKind::Command, reply("+OK accepted"));
        assert!(ok.is_success());
        let err = EslResponse::new(ResponseKind::Command, reply("-ERR no such channel"));
        assert!(!err.is_success());
        assert_eq!(err.reply_text(), Some("-ERR no such channel"));
    }

    #[test]
    fn test_api_success_reads_body() {
        let mut event = Event::new();
        event.set_header("Content-Type", "api/response");
        event.set_body("+OK 42");
        let resp = EslResponse::new(ResponseKind::Api, event);
        assert!(resp.is_success());

        let mut event = Event::new();
        event.set_body("-ERR no reply");
        assert!(!EslResponse::new(ResponseKind::Api, event).is_success());
    }

    #[test]
    fn test_bgapi_job_uuid() {
        let mut event = reply("+OK Job-UUID: 7f4db78a-17d7-11dd-b7a0-db4edd065621");
        let resp = EslResponse::new(ResponseKind::Bgapi, event.clone());
        assert!(resp.is_success());
        assert_eq!(
            resp.job_uuid(),
            Some("7f4db78a-17d7-11dd-b7a0-db4edd065621")
        );

        event.set_header("Job-UUID", "from-header");
        let resp = EslResponse::new(ResponseKind::Bgapi, event);
        assert_eq!(resp.job_uuid(), Some("from-header"));
    }

    #[test]
    fn test_neutral_never_success() {
        for kind in [ResponseKind::Command, ResponseKind::Api, ResponseKind::Bgapi] {
            let resp = EslResponse::neutral(kind);
            assert!(resp.is_neutral());
            assert!(!resp.is_success());
            assert_eq!(resp.kind(), kind);
        }
    }

    #[test]
    fn test_response_kind_for_verb() {
        assert_eq!(ResponseKind::for_verb("api"), ResponseKind::Api);
        assert_eq!(ResponseKind::for_verb("bgapi"), ResponseKind::Bgapi);
        assert_eq!(ResponseKind::for_verb("sendmsg"), ResponseKind::Command);
        assert_eq!(
            EslCommand::BgApi {
                command: "status".into()
            }
            .response_kind(),
            ResponseKind::Bgapi
        );
    }
}
