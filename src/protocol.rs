//! Wire framing: header blocks, length-delimited bodies, content-type dispatch

use crate::{
    constants::{
        CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
        CONTENT_TYPE_DISCONNECT_NOTICE, JSON_BODY_KEY, MAX_LINES_PER_EVENT,
    },
    error::{EslError, EslResult},
    event::{Event, EventFormat},
};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

/// One unit read off the socket, classified by its `Content-Type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `auth/request`, `command/reply` or `api/response`; belongs in the response slot.
    Reply(Event),
    /// An event in the connection's event format.
    Event(Event),
    /// `text/disconnect-notice`: the peer is about to close.
    Disconnect,
    /// Any other content type, body attached when one was announced.
    Unknown(Event),
}

/// Reads frames from the buffered read half of a connection.
pub struct EventReader<R> {
    inner: R,
    format: EventFormat,
    max_lines: usize,
}

impl<R: AsyncBufRead + Unpin> EventReader<R> {
    /// Wrap a buffered reader. `max_lines` caps the header block of one event.
    pub fn new(inner: R, format: EventFormat, max_lines: usize) -> Self {
        Self {
            inner,
            format,
            max_lines,
        }
    }

    /// Same as [`new`](Self::new) with the default line cap.
    pub fn with_format(inner: R, format: EventFormat) -> Self {
        Self::new(inner, format, MAX_LINES_PER_EVENT)
    }

    /// Event format this reader accepts.
    pub fn format(&self) -> EventFormat {
        self.format
    }

    /// Read one header block, terminated by a line that is exactly `"\n"`.
    ///
    /// Fails with `FramingLimit` after `max_lines` lines without a blank one,
    /// and with `ConnectionClosed` on end of stream.
    pub async fn read_event(&mut self) -> EslResult<Event> {
        let mut block = String::new();
        let mut line = Vec::with_capacity(128);

        for _ in 0..self.max_lines {
            line.clear();
            let n = self
                .inner
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 {
                return Err(EslError::ConnectionClosed);
            }
            if line == b"\n" {
                return Ok(parse_header_block(&block));
            }
            block.push_str(&String::from_utf8_lossy(&line));
        }

        Err(EslError::framing_limit(self.max_lines))
    }

    /// Read exactly `Content-Length` bytes announced by `event`.
    ///
    /// `None` when the header is missing or zero.
    pub async fn read_raw(&mut self, event: &Event) -> EslResult<Option<Vec<u8>>> {
        let length = match event.content_length() {
            Some(n) if n > 0 => n,
            _ => return Ok(None),
        };

        let mut raw = vec![0u8; length];
        match self
            .inner
            .read_exact(&mut raw)
            .await
        {
            Ok(_) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(EslError::ConnectionClosed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read one header block and whatever body its content type calls for.
    pub async fn read_frame(&mut self) -> EslResult<Frame> {
        let mut event = self
            .read_event()
            .await?;
        let content_type = event
            .content_type()
            .unwrap_or_default()
            .to_string();

        trace!("[RECV] frame content-type={:?}", content_type);

        match content_type.as_str() {
            CONTENT_TYPE_AUTH_REQUEST | CONTENT_TYPE_COMMAND_REPLY => Ok(Frame::Reply(event)),
            CONTENT_TYPE_API_RESPONSE => {
                if let Some(raw) = self
                    .read_raw(&event)
                    .await?
                {
                    event.set_body(raw);
                }
                Ok(Frame::Reply(event))
            }
            CONTENT_TYPE_DISCONNECT_NOTICE => {
                // Consume the notice text so framing stays aligned.
                self.read_raw(&event)
                    .await?;
                Ok(Frame::Disconnect)
            }
            ct if ct == self
                .format
                .content_type() =>
            {
                let raw = match self
                    .read_raw(&event)
                    .await?
                {
                    Some(raw) => raw,
                    None => return Ok(Frame::Event(event)),
                };
                let parsed = match self.format {
                    EventFormat::Plain => parse_plain_event(&raw),
                    EventFormat::Json => parse_json_event(&raw)?,
                };
                Ok(Frame::Event(parsed))
            }
            _ => {
                if let Some(raw) = self
                    .read_raw(&event)
                    .await?
                {
                    event.set_body(raw);
                }
                Ok(Frame::Unknown(event))
            }
        }
    }
}

/// Parse `key: value` lines into an [`Event`].
///
/// Splits on the first `:`, trims both sides and percent-decodes the value
/// (undecodable values are kept raw). Lines without a colon are skipped.
pub fn parse_header_block(block: &str) -> Event {
    let mut event = Event::new();

    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, raw_value)) = line.split_once(':') else {
            trace!("[RECV] skipping header line without colon: {:?}", line);
            continue;
        };
        let raw_value = raw_value.trim();
        let value = percent_decode_str(raw_value)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw_value.to_string());
        event.set_header(key.trim(), value);
    }

    event
}

/// Re-frame a `text/event-plain` body.
///
/// The inner header block ends at the first blank line. When it announces a
/// `Content-Length`, that many bytes from the tail of `raw` become the body,
/// untouched.
pub fn parse_plain_event(raw: &[u8]) -> Event {
    let text = String::from_utf8_lossy(raw);
    let header_section = match text.find("\n\n") {
        Some(pos) => &text[..pos],
        None => &text[..],
    };

    let mut event = parse_header_block(header_section);
    if let Some(length) = event
        .content_length()
        .filter(|n| *n > 0)
    {
        let start = raw
            .len()
            .saturating_sub(length);
        event.set_body(&raw[start..]);
    }

    event
}

/// Parse a `text/event-json` body.
///
/// String values are taken verbatim, other values JSON-encoded. `_body`
/// becomes the event body.
pub fn parse_json_event(raw: &[u8]) -> EslResult<Event> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| EslError::protocol_error("JSON event is not an object"))?;

    let mut event = Event::new();
    for (key, value) in obj {
        let value_str = match value {
            serde_json::Value::String(s) => s.clone(),
            _ => value.to_string(),
        };
        if key == JSON_BODY_KEY {
            event.set_body(value_str);
        } else {
            event.set_header(key.clone(), value_str);
        }
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EslEventType;

    fn reader(data: &[u8], format: EventFormat) -> EventReader<&[u8]> {
        EventReader::with_format(data, format)
    }

    #[tokio::test]
    async fn test_read_event_header_count() {
        let data = b"Content-Type: command/reply\nReply-Text: +OK accepted\nX-One: 1\n\n";
        let mut r = reader(data, EventFormat::Json);
        let event = r
            .read_event()
            .await
            .unwrap();

        assert_eq!(event.header_count(), 3);
        assert_eq!(event.content_type(), Some("command/reply"));
        assert_eq!(event.header("Reply-Text"), Some("+OK accepted"));
    }

    #[tokio::test]
    async fn test_read_event_closed_mid_header() {
        let data = b"Content-Type: command/reply\nReply-Text: +OK";
        let mut r = reader(data, EventFormat::Json);
        let err = r
            .read_event()
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_event_line_cap() {
        let mut data = String::new();
        for i in 0..5 {
            data.push_str(&format!("X-Header-{}: {}\n", i, i));
        }
        data.push('\n');

        let mut r = EventReader::new(data.as_bytes(), EventFormat::Json, 4);
        let err = r
            .read_event()
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::FramingLimit { limit: 4 }));

        let mut r = EventReader::new(data.as_bytes(), EventFormat::Json, 6);
        let event = r
            .read_event()
            .await
            .unwrap();
        assert_eq!(event.header_count(), 5);
    }

    #[tokio::test]
    async fn test_read_raw_short_body() {
        let data = b"Content-Type: api/response\nContent-Length: 10\n\nshort";
        let mut r = reader(data, EventFormat::Json);
        let err = r
            .read_frame()
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_api_response_body() {
        let data = b"Content-Type: api/response\nContent-Length: 13\n\n+OK 1234-abcdContent-Type: command/reply\nReply-Text: +OK\n\n";
        let mut r = reader(data, EventFormat::Json);

        let Frame::Reply(api) = r
            .read_frame()
            .await
            .unwrap()
        else {
            panic!("expected reply");
        };
        assert_eq!(api.body(), Some("+OK 1234-abcd"));

        let Frame::Reply(cmd) = r
            .read_frame()
            .await
            .unwrap()
        else {
            panic!("expected reply");
        };
        assert_eq!(cmd.header("Reply-Text"), Some("+OK"));
    }

    #[tokio::test]
    async fn test_plain_event_percent_decoding() {
        let body = "Event-Name: CHANNEL_HANGUP\nUnique-ID: uuid-1\nHangup-Cause: NORMAL_CLEARING\nCaller-Caller-ID-Name: John%20Doe\n\n";
        let data = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
            body.len(),
            body
        );
        let mut r = reader(data.as_bytes(), EventFormat::Plain);

        let Frame::Event(event) = r
            .read_frame()
            .await
            .unwrap()
        else {
            panic!("expected event");
        };
        assert_eq!(event.event_type(), Some(EslEventType::ChannelHangup));
        assert_eq!(event.unique_id(), Some("uuid-1"));
        assert_eq!(event.header("Caller-Caller-ID-Name"), Some("John Doe"));
        assert!(event
            .body()
            .is_none());
    }

    #[tokio::test]
    async fn test_api_response_keeps_raw_bytes() {
        let mut data = b"Content-Type: api/response\nContent-Length: 5\n\n".to_vec();
        data.extend_from_slice(&[b'+', b'O', b'K', 0xff, 0xfe]);
        let mut r = reader(&data, EventFormat::Json);

        let Frame::Reply(api) = r
            .read_frame()
            .await
            .unwrap()
        else {
            panic!("expected reply");
        };
        assert_eq!(api.body_bytes(), Some(&b"+OK\xff\xfe"[..]));
        assert_eq!(api.body(), None);
    }

    #[test]
    fn test_plain_event_inner_body_from_tail() {
        let raw = b"Event-Name: BACKGROUND_JOB\nJob-UUID: job-1\nContent-Length: 9\n\n+OK done\n";
        let event = parse_plain_event(raw);
        assert_eq!(event.header("Job-UUID"), Some("job-1"));
        assert_eq!(event.body(), Some("+OK done\n"));
    }

    #[tokio::test]
    async fn test_json_event() {
        let json = r#"{"Event-Name":"CHANNEL_EXECUTE_COMPLETE","Unique-ID":"uuid-2","Application":"playback","Event-Sequence":42,"_body":"payload"}"#;
        let data = format!(
            "Content-Length: {}\nContent-Type: text/event-json\n\n{}",
            json.len(),
            json
        );
        let mut r = reader(data.as_bytes(), EventFormat::Json);

        let Frame::Event(event) = r
            .read_frame()
            .await
            .unwrap()
        else {
            panic!("expected event");
        };
        assert_eq!(
            event.event_type(),
            Some(EslEventType::ChannelExecuteComplete)
        );
        assert_eq!(event.header("Application"), Some("playback"));
        assert_eq!(event.header("Event-Sequence"), Some("42"));
        assert_eq!(event.body(), Some("payload"));
        assert!(event
            .header("_body")
            .is_none());
    }

    #[tokio::test]
    async fn test_json_event_invalid() {
        let data = b"Content-Length: 5\nContent-Type: text/event-json\n\n{nope";
        let mut r = reader(data, EventFormat::Json);
        let err = r
            .read_frame()
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Json(_)));
    }

    #[tokio::test]
    async fn test_other_format_is_unknown() {
        let body = "Event-Name: HEARTBEAT\n\n";
        let data = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}Content-Type: command/reply\nReply-Text: +OK\n\n",
            body.len(),
            body
        );
        let mut r = reader(data.as_bytes(), EventFormat::Json);

        let Frame::Unknown(event) = r
            .read_frame()
            .await
            .unwrap()
        else {
            panic!("expected unknown");
        };
        assert_eq!(event.body(), Some(body));

        let next = r
            .read_frame()
            .await
            .unwrap();
        assert!(matches!(next, Frame::Reply(_)));
    }

    #[tokio::test]
    async fn test_disconnect_notice() {
        let notice = "Disconnected, goodbye.\n";
        let data = format!(
            "Content-Type: text/disconnect-notice\nContent-Length: {}\n\n{}",
            notice.len(),
            notice
        );
        let mut r = reader(data.as_bytes(), EventFormat::Json);
        assert_eq!(
            r.read_frame()
                .await
                .unwrap(),
            Frame::Disconnect
        );
    }

    #[test]
    fn test_parse_header_block_rules() {
        let event = parse_header_block(
            "Key-One:  spaced value  \nno colon here\nUrl: http%3A%2F%2Fhost%2Fa\nBad: 100%\nKey-One: again\n",
        );
        assert_eq!(event.header("Key-One"), Some("again"));
        assert_eq!(event.header("Url"), Some("http://host/a"));
        assert_eq!(event.header("Bad"), Some("100%"));
        assert_eq!(
            event
                .headers()
                .next(),
            Some(("Key-One", "again"))
        );
        assert_eq!(event.header_count(), 3);
    }
}
