//! Scripted FreeSWITCH peer and a recording document fetcher for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use freeswitch_restxml::{CallFlowFetcher, FetchError, HttpMethod};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
};
use tokio::task::JoinHandle;

/// One command as the switch received it.
#[derive(Debug, Clone, Default)]
pub struct SwitchCommand {
    pub line: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl SwitchCommand {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn verb(&self) -> &str {
        self.line
            .split(' ')
            .next()
            .unwrap_or_default()
    }

    pub fn app(&self) -> Option<&str> {
        self.header("execute-app-name")
    }

    /// `execute <app> [<arg>]` for sendmsg, the command line otherwise.
    pub fn describe(&self) -> String {
        match self.app() {
            Some(app) => match &self.body {
                Some(arg) => format!("execute {} {}", app, arg),
                None => format!("execute {}", app),
            },
            None => self
                .line
                .clone(),
        }
    }
}

/// How the mock switch answers.
#[derive(Debug, Clone)]
pub struct SwitchScript {
    /// Headers of the `connect` reply (channel data).
    pub channel: Vec<(String, String)>,
    /// Channel variables visible to `uuid_getvar`; `set`/`unset` update them.
    pub vars: HashMap<String, String>,
    /// Send `CHANNEL_EXECUTE_COMPLETE` after each executed application.
    pub complete_apps: bool,
    /// Executing this application hangs the channel up instead of completing it.
    pub hangup_on_app: Option<String>,
    pub hangup_cause: String,
    /// Replying to this application is the last thing the switch does before
    /// closing the socket.
    pub close_on_app: Option<String>,
}

impl SwitchScript {
    /// Inbound call `uuid` whose answer URL is `answer_url`.
    pub fn inbound(uuid: &str, answer_url: &str) -> Self {
        let mut vars = HashMap::new();
        vars.insert("restxml_answer_url".to_string(), answer_url.to_string());
        Self {
            channel: vec![
                ("Unique-ID".into(), uuid.into()),
                ("Call-Direction".into(), "inbound".into()),
                ("Caller-Caller-ID-Number".into(), "1000".into()),
                ("Caller-Destination-Number".into(), "2000".into()),
            ],
            vars,
            complete_apps: true,
            hangup_on_app: None,
            hangup_cause: "NORMAL_CLEARING".into(),
            close_on_app: None,
        }
    }

    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.vars
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_channel_header(mut self, name: &str, value: &str) -> Self {
        self.channel
            .retain(|(k, _)| k != name);
        self.channel
            .push((name.to_string(), value.to_string()));
        self
    }

    fn uuid(&self) -> String {
        self.channel
            .iter()
            .find(|(k, _)| k == "Unique-ID")
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }
}

pub type CommandLog = Arc<Mutex<Vec<SwitchCommand>>>;

/// Run a scripted switch on `stream` until the other side closes it.
pub fn spawn_switch(stream: DuplexStream, mut script: SwitchScript) -> (JoinHandle<()>, CommandLog) {
    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
    let recorded = log.clone();
    let handle = tokio::spawn(async move {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        while let Some(cmd) = read_command(&mut reader).await {
            recorded
                .lock()
                .unwrap()
                .push(cmd.clone());
            if answer(&mut writer, &mut script, &cmd)
                .await
                .is_err()
            {
                break;
            }
        }
    });
    (handle, log)
}

pub fn commands(log: &CommandLog) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .map(SwitchCommand::describe)
        .collect()
}

/// Read one command block; `None` on EOF.
pub async fn read_command<R>(reader: &mut BufReader<R>) -> Option<SwitchCommand>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut cmd = SwitchCommand::default();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .ok()?;
        if n == 0 {
            return None;
        }
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            if cmd
                .line
                .is_empty()
            {
                continue;
            }
            break;
        }
        if cmd
            .line
            .is_empty()
        {
            cmd.line = line.to_string();
        } else if let Some((k, v)) = line.split_once(':') {
            cmd.headers
                .push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    if let Some(len) = cmd
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .await
            .ok()?;
        // arg line terminator, then the block terminator
        let mut rest = String::new();
        reader
            .read_line(&mut rest)
            .await
            .ok()?;
        rest.clear();
        reader
            .read_line(&mut rest)
            .await
            .ok()?;
        cmd.body = Some(String::from_utf8_lossy(&body).into_owned());
    }
    Some(cmd)
}

pub fn command_reply(headers: &[(&str, &str)]) -> String {
    let mut frame = String::from("Content-Type: command/reply\nReply-Text: +OK\n");
    for (k, v) in headers {
        frame.push_str(&format!("{}: {}\n", k, v));
    }
    frame.push('\n');
    frame
}

pub fn api_response(body: &str) -> String {
    format!(
        "Content-Type: api/response\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

pub fn json_event(headers: &[(&str, &str)]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    let body = serde_json::Value::Object(map).to_string();
    format!(
        "Content-Length: {}\nContent-Type: text/event-json\n\n{}",
        body.len(),
        body
    )
}

async fn answer<W: AsyncWrite + Unpin>(
    writer: &mut W,
    script: &mut SwitchScript,
    cmd: &SwitchCommand,
) -> std::io::Result<()> {
    let uuid = script.uuid();
    let mut frames = Vec::new();

    match cmd.verb() {
        "connect" => {
            let headers: Vec<(&str, &str)> = script
                .channel
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            frames.push(command_reply(&headers));
        }
        "api" => {
            let mut words = cmd
                .line
                .split_whitespace()
                .skip(1);
            let body = match (words.next(), words.nth(1)) {
                (Some("uuid_getvar"), Some(name)) => script
                    .vars
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| "_undef_".to_string()),
                _ => "-ERR unsupported".to_string(),
            };
            frames.push(api_response(&body));
        }
        "sendmsg" => {
            frames.push(command_reply(&[]));
            let app = cmd
                .app()
                .unwrap_or_default()
                .to_string();
            let arg = cmd
                .body
                .clone()
                .unwrap_or_default();
            match app.as_str() {
                "set" => {
                    if let Some((k, v)) = arg.split_once('=') {
                        script
                            .vars
                            .insert(k.to_string(), v.to_string());
                    }
                }
                "unset" => {
                    script
                        .vars
                        .remove(&arg);
                }
                _ => {}
            }
            if script.close_on_app.as_deref() == Some(app.as_str()) {
                write_frames(writer, &frames).await?;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    format!("closing after {}", app),
                ));
            }
            if script.hangup_on_app.as_deref() == Some(app.as_str()) {
                frames.push(json_event(&[
                    ("Event-Name", "CHANNEL_HANGUP"),
                    ("Unique-ID", uuid.as_str()),
                    ("Hangup-Cause", script.hangup_cause.as_str()),
                ]));
            } else if script.complete_apps {
                frames.push(json_event(&[
                    ("Event-Name", "CHANNEL_EXECUTE_COMPLETE"),
                    ("Unique-ID", uuid.as_str()),
                    ("Application", app.as_str()),
                    ("Application-Data", arg.as_str()),
                ]));
            }
        }
        _ => frames.push(command_reply(&[])),
    }

    write_frames(writer, &frames).await
}

async fn write_frames<W: AsyncWrite + Unpin>(writer: &mut W, frames: &[String]) -> std::io::Result<()> {
    for frame in frames {
        writer
            .write_all(frame.as_bytes())
            .await?;
    }
    writer
        .flush()
        .await
}

/// A fetch as the web application saw it.
#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub url: String,
    pub params: BTreeMap<String, String>,
    pub method: HttpMethod,
}

/// Serves fixed documents by URL and records every request.
#[derive(Default)]
pub struct RecordingFetcher {
    documents: HashMap<String, String>,
    pub requests: Mutex<Vec<FetchRecord>>,
}

impl RecordingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(mut self, url: &str, body: &str) -> Self {
        self.documents
            .insert(url.to_string(), body.to_string());
        self
    }

    pub fn requests(&self) -> Vec<FetchRecord> {
        self.requests
            .lock()
            .unwrap()
            .clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.url)
            .collect()
    }

    /// Wait until `url` has been requested `count` times.
    pub async fn wait_for(&self, url: &str, count: usize) -> Vec<FetchRecord> {
        for _ in 0..200 {
            let matching: Vec<_> = self
                .requests()
                .into_iter()
                .filter(|r| r.url == url)
                .collect();
            if matching.len() >= count {
                return matching;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} was not requested {} times: {:?}", url, count, self.urls());
    }
}

#[async_trait]
impl CallFlowFetcher for RecordingFetcher {
    async fn fetch(
        &self,
        url: &str,
        params: &BTreeMap<String, String>,
        method: HttpMethod,
    ) -> Result<String, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push(FetchRecord {
                url: url.to_string(),
                params: params.clone(),
                method,
            });
        match self
            .documents
            .get(url)
        {
            Some(body) => Ok(body.clone()),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}
