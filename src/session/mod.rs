//! Outbound call sessions: direction resolution and the fetch, parse, execute loop
//!
//! One [`CallSession`] drives one channel. It owns an [`EslConnection`] whose
//! handlers feed the session's action queue, fetches a RESTXML document from the
//! web application, and runs its elements in order until the call ends, the
//! document runs out, or the redirect ceiling is reached.

mod control;
mod handlers;

pub use control::{CallControl, SessionState};
pub use handlers::WAIT_FOR_ACTIONS;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{CallDirection, CallStatus};
use crate::command::EslCommand;
use crate::connection::{ConnectionOptions, EslConnection};
use crate::constants::{DEFAULT_HANDLER_POOL_SIZE, MAX_REDIRECT, SESSION_EVENT_FILTER};
use crate::dispatch::WorkerPool;
use crate::error::{CallError, CallResult, RestXmlError};
use crate::event::Event;
use crate::headers::EventHeader;
use crate::http::{CallFlowFetcher, HttpMethod};
use crate::restxml::{parse_document, Element, ElementRegistry, Flow, RedirectTarget, NO_ANSWER_ELEMENTS};
use crate::variables::ChannelVariable;

/// Pause between a redirect and the next fetch.
const REDIRECT_PAUSE: Duration = Duration::from_millis(10);

/// Resolved settings a session is built from.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Used for inbound calls that carry no URL of their own.
    pub default_answer_url: Option<String>,
    /// Falls back to `default_answer_url` when unset.
    pub default_hangup_url: Option<String>,
    pub default_method: HttpMethod,
    /// Fetch iterations allowed per call.
    pub max_redirects: usize,
    pub connection: ConnectionOptions,
    /// Concurrent event handlers per connection, 0 for unbounded.
    pub handler_pool_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_answer_url: None,
            default_hangup_url: None,
            default_method: HttpMethod::default(),
            max_redirects: MAX_REDIRECT,
            connection: ConnectionOptions::default(),
            handler_pool_size: DEFAULT_HANDLER_POOL_SIZE,
        }
    }
}

impl SessionConfig {
    /// Hangup URL used when the call does not set one.
    pub fn effective_hangup_url(&self) -> Option<String> {
        self.default_hangup_url
            .clone()
            .or_else(|| {
                self.default_answer_url
                    .clone()
            })
            .filter(|u| !u.is_empty())
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEnd {
    /// Neither the channel nor the configuration named a URL to fetch.
    NoTargetUrl,
    /// A fetch failed or returned nothing.
    NoDocument,
    /// The last document ran to its end.
    Completed,
    /// The channel hung up.
    HungUp,
    /// Every iteration redirected.
    MaxRedirects,
    /// A fetched document was rejected by the parser.
    DocumentRejected(RestXmlError),
    /// The event socket failed.
    ConnectionError(String),
}

/// Drives one outbound socket from handshake to disconnect.
pub struct CallSession {
    config: Arc<SessionConfig>,
    fetcher: Arc<dyn CallFlowFetcher>,
    elements: Arc<ElementRegistry>,
    request_id: u64,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("request_id", &self.request_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    pub fn new(
        config: Arc<SessionConfig>,
        fetcher: Arc<dyn CallFlowFetcher>,
        elements: Arc<ElementRegistry>,
        request_id: u64,
    ) -> Self {
        Self {
            config,
            fetcher,
            elements,
            request_id,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Run the call on `stream` and disconnect when done.
    pub async fn run<S>(self, stream: S) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState::new(
            self.request_id,
            self.config
                .default_method,
            self.config
                .effective_hangup_url(),
            action_tx,
            self.fetcher
                .clone(),
        ));
        let conn = EslConnection::start(
            stream,
            self.config
                .connection
                .clone(),
            state.clone(),
            Arc::new(handlers::registry()),
            WorkerPool::current(
                self.config
                    .handler_pool_size,
            ),
        );
        let control = CallControl::new(conn.clone(), state.clone(), action_rx);

        let end = match self
            .drive(&control)
            .await
        {
            Ok(end) => end,
            Err(CallError::HungUp) => {
                warn!("Channel has hung up, breaking Processing Call");
                SessionEnd::HungUp
            }
            Err(CallError::Document(e)) => {
                error!("Processing Call Failure: {}", e);
                SessionEnd::DocumentRejected(e)
            }
            Err(CallError::Esl(e)) => {
                error!("Processing Call Failure: {}", e);
                SessionEnd::ConnectionError(e.to_string())
            }
        };
        info!("Processing Call Ended: {:?}", end);

        state.queue_action(Event::default());
        conn.disconnect()
            .await;
        end
    }

    async fn drive(&self, control: &CallControl) -> CallResult<SessionEnd> {
        let channel = control
            .connection()
            .connect()
            .await?;
        let uuid = channel
            .unique_id()
            .unwrap_or_default()
            .to_string();
        debug!("Connected to channel {}", uuid);
        control
            .state()
            .set_uuid(uuid.clone());

        let format = control
            .connection()
            .event_format();
        control
            .command(&EslCommand::Event {
                format,
                events: SESSION_EVENT_FILTER.to_string(),
            })
            .await?;

        self.setup(control, &uuid)
            .await?;

        let Some(target_url) = self
            .resolve_direction(control, &channel)
            .await?
        else {
            error!("Aborting -- No Call Url found !");
            return Ok(SessionEnd::NoTargetUrl);
        };

        info!("Processing Call");
        self.process_call(control, target_url)
            .await
    }

    async fn setup(&self, control: &CallControl, uuid: &str) -> CallResult<()> {
        control
            .command(&EslCommand::Resume)
            .await?;
        control
            .command(&EslCommand::Filter {
                header: EventHeader::UniqueId.to_string(),
                value: uuid.to_string(),
            })
            .await?;
        control
            .command(&EslCommand::Linger)
            .await?;
        control
            .set_var(ChannelVariable::App, "true")
            .await?;
        control
            .set_var(ChannelVariable::HangupAfterBridge, "false")
            .await?;
        Ok(())
    }

    /// Seed session parameters and find the first document URL.
    async fn resolve_direction(&self, control: &CallControl, channel: &Event) -> CallResult<Option<String>> {
        let state = control.state();
        let direction = channel
            .call_direction()
            .unwrap_or(CallDirection::Inbound);
        state.set_direction(direction);

        state.set_param("CallUUID", control.uuid());
        state.set_param(
            "From",
            channel
                .typed_header(EventHeader::CallerCallerIdNumber)
                .unwrap_or_default(),
        );
        state.set_param(
            "To",
            channel
                .typed_header(EventHeader::CallerDestinationNumber)
                .unwrap_or_default(),
        );
        state.set_param("Direction", direction.as_str());

        let (target_url, sched_hangup_id) = match direction {
            CallDirection::Outbound => {
                if let Some(aleg_uuid) = channel
                    .typed_header(EventHeader::CallerUniqueId)
                    .filter(|v| !v.is_empty())
                {
                    state.set_param("ALegUUID", aleg_uuid);
                }
                if let Some(aleg_request_uuid) = channel.channel_variable(ChannelVariable::RequestUuid) {
                    state.set_param("ALegRequestUUID", aleg_request_uuid);
                }
                let target = pick_target(
                    channel
                        .channel_variable(ChannelVariable::TransferUrl)
                        .map(str::to_string),
                    channel
                        .channel_variable(ChannelVariable::AnswerUrl)
                        .map(str::to_string),
                    None,
                );
                let Some(target) = target else {
                    return Ok(None);
                };
                let sched = channel
                    .channel_variable(ChannelVariable::SchedHangupId)
                    .map(str::to_string);
                state.clear_hangup_urls();
                state.set_param("CallStatus", CallStatus::InProgress.as_str());
                (target, sched)
            }
            _ => {
                let transfer_url = control
                    .get_var(ChannelVariable::TransferUrl)
                    .await?;
                let answer_url = control
                    .get_var(ChannelVariable::AnswerUrl)
                    .await?;
                let target = pick_target(
                    transfer_url,
                    answer_url,
                    self.config
                        .default_answer_url
                        .clone(),
                );
                let Some(target) = target else {
                    return Ok(None);
                };
                let sched = control
                    .get_var(ChannelVariable::SchedHangupId)
                    .await?;
                state.set_hangup_url(
                    control
                        .get_var(ChannelVariable::HangupUrl)
                        .await?,
                );
                state.set_param("CallStatus", CallStatus::Ringing.as_str());
                (target, sched)
            }
        };

        if let Some(sched) = sched_hangup_id.filter(|s| !s.is_empty()) {
            state.set_param("ScheduledHangupId", sched);
            control
                .unset_var(ChannelVariable::SchedHangupId)
                .await?;
        }
        Ok(Some(target_url))
    }

    async fn process_call(&self, control: &CallControl, target_url: String) -> CallResult<SessionEnd> {
        let mut target = RedirectTarget {
            url: target_url,
            method: self
                .config
                .default_method,
            params: BTreeMap::new(),
        };

        for _ in 0..self
            .config
            .max_redirects
        {
            if control.is_hungup() {
                return Err(CallError::HungUp);
            }

            let params = control
                .state()
                .merged_params(&target.params);
            info!("Fetching RESTXML from {} with {:?}", target.url, params);
            let text = match self
                .fetcher
                .fetch(&target.url, &params, target.method)
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!("No XML Response: {}", e);
                    return Ok(SessionEnd::NoDocument);
                }
            };

            let elements = parse_document(&text, &self.elements, &target.url)?;
            match self
                .execute_elements(control, elements)
                .await?
            {
                Flow::Completed => {
                    info!("End of RESTXML");
                    return Ok(SessionEnd::Completed);
                }
                Flow::HungUp => return Err(CallError::HungUp),
                Flow::Redirect(next) => {
                    if control.is_hungup() {
                        return Err(CallError::HungUp);
                    }
                    info!("Redirecting to {} {} to fetch RESTXML", next.method, next.url);
                    target = next;
                    tokio::time::sleep(REDIRECT_PAUSE).await;
                }
            }
        }

        warn!("Max Redirect Reached !");
        Ok(SessionEnd::MaxRedirects)
    }

    /// Run `elements` in order, then hang up if nothing else owns the call.
    async fn execute_elements(&self, control: &CallControl, elements: Vec<Box<dyn Element>>) -> CallResult<Flow> {
        for mut element in elements {
            match self
                .execute_element(control, element.as_mut())
                .await
            {
                Ok(Flow::Completed) => {}
                Ok(flow) => return Ok(flow),
                Err(CallError::HungUp) => return Ok(Flow::HungUp),
                Err(e) => return Err(e),
            }
        }

        match self
            .hangup_on_completion(control)
            .await
        {
            Ok(()) => Ok(Flow::Completed),
            Err(CallError::HungUp) => Ok(Flow::HungUp),
            Err(e) => Err(e),
        }
    }

    async fn execute_element(&self, control: &CallControl, element: &mut dyn Element) -> CallResult<Flow> {
        if control.is_hungup() {
            return Err(CallError::HungUp);
        }
        element
            .prepare()
            .await?;

        let state = control.state();
        let inbound = state.direction() == Some(CallDirection::Inbound);
        if inbound && !state.is_answered() && !NO_ANSWER_ELEMENTS.contains(&element.tag()) {
            debug!("Answering because Element {} need it", element.tag());
            control
                .answer()
                .await?;
            state.mark_answered();
        }

        element
            .run(control)
            .await
    }

    async fn hangup_on_completion(&self, control: &CallControl) -> CallResult<()> {
        if control.is_hungup() {
            return Ok(());
        }
        let transfer = control
            .get_var(ChannelVariable::TransferProgress)
            .await?;
        if transfer.as_deref() == Some("true") {
            warn!("No more Elements, Transfer In Progress !");
            return Ok(());
        }

        warn!("No more Elements, Hangup Now !");
        let state = control.state();
        state.set_param("CallStatus", CallStatus::Completed.as_str());
        match control
            .hangup("NORMAL_CLEARING")
            .await
        {
            Ok(_) | Err(CallError::HungUp) => {}
            Err(e) => return Err(e),
        }
        if state
            .hangup_target()
            .is_some()
            && !state.hangup_notified()
        {
            if state
                .hangup_cause()
                .is_none()
            {
                state.set_param("HangupCause", "NORMAL_CLEARING");
            }
            state.notify_hangup();
        }
        Ok(())
    }
}

fn pick_target(transfer_url: Option<String>, answer_url: Option<String>, default_url: Option<String>) -> Option<String> {
    if let Some(url) = transfer_url.filter(|u| !u.is_empty()) {
        info!("Using TransferUrl {}", url);
        return Some(url);
    }
    if let Some(url) = answer_url.filter(|u| !u.is_empty()) {
        info!("Using AnswerUrl {}", url);
        return Some(url);
    }
    if let Some(url) = default_url.filter(|u| !u.is_empty()) {
        info!("Using DefaultAnswerUrl {}", url);
        return Some(url);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hangup_url_falls_back_to_answer_url() {
        let mut config = SessionConfig {
            default_answer_url: Some("http://app/answer".into()),
            ..Default::default()
        };
        assert_eq!(config.effective_hangup_url().as_deref(), Some("http://app/answer"));
        config.default_hangup_url = Some("http://app/hangup".into());
        assert_eq!(config.effective_hangup_url().as_deref(), Some("http://app/hangup"));
        assert_eq!(SessionConfig::default().effective_hangup_url(), None);
    }

    #[test]
    fn test_target_priority() {
        let s = |v: &str| Some(v.to_string());
        assert_eq!(pick_target(s("x"), s("a"), s("d")), s("x"));
        assert_eq!(pick_target(s(""), s("a"), s("d")), s("a"));
        assert_eq!(pick_target(None, None, s("d")), s("d"));
        assert_eq!(pick_target(None, None, None), None);
    }
}
