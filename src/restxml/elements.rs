//! Built-in call-flow elements

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Element, Flow, RedirectTarget, XmlNode};
use crate::error::{CallResult, RestXmlError};
use crate::http::HttpMethod;
use crate::session::CallControl;

fn parse_loop(node: &XmlNode) -> Result<u32, RestXmlError> {
    match node.attribute("loop") {
        None => Ok(1),
        Some(raw) => match raw
            .trim()
            .parse::<u32>()
        {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(RestXmlError::Format(format!(
                "{} loop must be a positive integer, got '{}'",
                node.tag, raw
            ))),
        },
    }
}

fn required_text(node: &XmlNode) -> Result<String, RestXmlError> {
    let text = node.text();
    if text.is_empty() {
        return Err(RestXmlError::Format(format!("{} requires text", node.tag)));
    }
    Ok(text.to_string())
}

/// Run `app` `loops` times, each time waiting for its completion event.
///
/// A neutral completion (transfer or teardown) stops the loop early.
async fn run_blocking(control: &CallControl, app: &str, arg: &str, loops: u32) -> CallResult<Flow> {
    for _ in 0..loops {
        control
            .execute(app, Some(arg), true)
            .await?;
        let event = control
            .wait_for_action()
            .await;
        if event.is_empty() {
            debug!("{} interrupted", app);
            break;
        }
    }
    Ok(Flow::Completed)
}

/// Text to speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Speak {
    text: String,
    voice: String,
    engine: String,
    loops: u32,
}

impl Default for Speak {
    fn default() -> Self {
        Self {
            text: String::new(),
            voice: "slt".into(),
            engine: "flite".into(),
            loops: 1,
        }
    }
}

#[async_trait]
impl Element for Speak {
    fn tag(&self) -> &'static str {
        "Speak"
    }

    fn parse_element(&mut self, node: &XmlNode, _target_url: &str) -> Result<(), RestXmlError> {
        self.text = required_text(node)?;
        if let Some(voice) = node
            .attribute("voice")
            .filter(|v| !v.is_empty())
        {
            self.voice = voice.to_string();
        }
        if let Some(engine) = node
            .attribute("engine")
            .filter(|v| !v.is_empty())
        {
            self.engine = engine.to_string();
        }
        self.loops = parse_loop(node)?;
        Ok(())
    }

    async fn run(&self, control: &CallControl) -> CallResult<Flow> {
        let arg = format!("{}|{}|{}", self.engine, self.voice, self.text);
        info!("Speaking '{}'", self.text);
        run_blocking(control, "speak", &arg, self.loops).await
    }
}

/// Play an audio file or URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Play {
    sound: String,
    loops: u32,
}

impl Default for Play {
    fn default() -> Self {
        Self {
            sound: String::new(),
            loops: 1,
        }
    }
}

#[async_trait]
impl Element for Play {
    fn tag(&self) -> &'static str {
        "Play"
    }

    fn parse_element(&mut self, node: &XmlNode, _target_url: &str) -> Result<(), RestXmlError> {
        self.sound = required_text(node)?;
        self.loops = parse_loop(node)?;
        Ok(())
    }

    async fn run(&self, control: &CallControl) -> CallResult<Flow> {
        info!("Playing {}", self.sound);
        run_blocking(control, "playback", &self.sound, self.loops).await
    }
}

/// Silence for `length` seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wait {
    length_secs: u32,
}

impl Default for Wait {
    fn default() -> Self {
        Self { length_secs: 1 }
    }
}

#[async_trait]
impl Element for Wait {
    fn tag(&self) -> &'static str {
        "Wait"
    }

    fn parse_element(&mut self, node: &XmlNode, _target_url: &str) -> Result<(), RestXmlError> {
        if let Some(raw) = node.attribute("length") {
            self.length_secs = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    RestXmlError::Format(format!("Wait length must be a positive integer, got '{}'", raw))
                })?;
        }
        Ok(())
    }

    async fn run(&self, control: &CallControl) -> CallResult<Flow> {
        let millis = u64::from(self.length_secs) * 1000;
        run_blocking(control, "sleep", &millis.to_string(), 1).await
    }
}

/// Early media: runs its children before the call is answered.
#[derive(Debug, Default)]
pub struct PreAnswer {
    children: Vec<Box<dyn Element>>,
}

#[async_trait]
impl Element for PreAnswer {
    fn tag(&self) -> &'static str {
        "PreAnswer"
    }

    fn nestables(&self) -> &'static [&'static str] {
        &["Speak", "Play", "Wait"]
    }

    fn parse_element(&mut self, _node: &XmlNode, _target_url: &str) -> Result<(), RestXmlError> {
        Ok(())
    }

    fn attach_child(&mut self, child: Box<dyn Element>) -> Result<(), RestXmlError> {
        self.children
            .push(child);
        Ok(())
    }

    async fn prepare(&mut self) -> CallResult<()> {
        for child in &mut self.children {
            child
                .prepare()
                .await?;
        }
        Ok(())
    }

    async fn run(&self, control: &CallControl) -> CallResult<Flow> {
        control
            .pre_answer()
            .await?;
        for child in &self.children {
            match child
                .run(control)
                .await?
            {
                Flow::Completed => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Completed)
    }
}

/// End the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hangup {
    reason: Option<String>,
}

impl Hangup {
    /// Switch hangup cause for the `reason` attribute.
    pub fn cause(&self) -> &'static str {
        match self
            .reason
            .as_deref()
        {
            Some("rejected") => "CALL_REJECTED",
            Some("busy") => "USER_BUSY",
            _ => "NORMAL_CLEARING",
        }
    }
}

#[async_trait]
impl Element for Hangup {
    fn tag(&self) -> &'static str {
        "Hangup"
    }

    fn parse_element(&mut self, node: &XmlNode, _target_url: &str) -> Result<(), RestXmlError> {
        self.reason = node
            .attribute("reason")
            .map(|r| {
                r.trim()
                    .to_ascii_lowercase()
            });
        Ok(())
    }

    async fn run(&self, control: &CallControl) -> CallResult<Flow> {
        info!("Hanging up with {}", self.cause());
        control
            .hangup(self.cause())
            .await?;
        Ok(Flow::Completed)
    }
}

/// Continue the call with the document at another URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redirect {
    url: String,
    method: HttpMethod,
}

impl Redirect {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }
}

fn resolve_url(target_url: &str, location: &str) -> Result<String, RestXmlError> {
    let joined = match url::Url::parse(target_url) {
        Ok(base) => base.join(location),
        Err(_) => url::Url::parse(location),
    };
    joined
        .map(String::from)
        .map_err(|e| RestXmlError::Format(format!("Redirect url '{}' is invalid: {}", location, e)))
}

#[async_trait]
impl Element for Redirect {
    fn tag(&self) -> &'static str {
        "Redirect"
    }

    fn parse_element(&mut self, node: &XmlNode, target_url: &str) -> Result<(), RestXmlError> {
        let location = node.text();
        if location.is_empty() {
            return Err(RestXmlError::Format("Redirect must have a URL".into()));
        }
        self.url = resolve_url(target_url, location)?;
        if let Some(raw) = node.attribute("method") {
            self.method = raw
                .parse()
                .map_err(|e| RestXmlError::Format(format!("Redirect {}", e)))?;
        }
        Ok(())
    }

    async fn run(&self, _control: &CallControl) -> CallResult<Flow> {
        info!("Redirecting to {} {}", self.method, self.url);
        Ok(Flow::Redirect(RedirectTarget {
            url: self.url.clone(),
            method: self.method,
            params: BTreeMap::new(),
        }))
    }
}
