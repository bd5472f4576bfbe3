//! Per-call state shared with event handlers, and the command surface elements drive

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument, Span};

use crate::channel::CallDirection;
use crate::command::{EslCommand, EslResponse};
use crate::connection::EslConnection;
use crate::dispatch::{EventContext, HandlerFailure};
use crate::error::{CallError, CallResult};
use crate::event::Event;
use crate::http::{CallFlowFetcher, HttpMethod};
use crate::variables::ChannelVariable;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// State of one call, written by the session and by its event handlers.
pub struct SessionState {
    request_id: u64,
    uuid: OnceLock<String>,
    direction: OnceLock<CallDirection>,
    hangup_cause: OnceLock<String>,
    answered: AtomicBool,
    hangup_notified: AtomicBool,
    params: Mutex<BTreeMap<String, String>>,
    hangup_url: Mutex<Option<String>>,
    default_hangup_url: Mutex<Option<String>>,
    default_method: HttpMethod,
    actions: mpsc::UnboundedSender<Event>,
    fetcher: Arc<dyn CallFlowFetcher>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("request_id", &self.request_id)
            .field("uuid", &self.uuid.get())
            .field("direction", &self.direction.get())
            .field("hangup_cause", &self.hangup_cause.get())
            .finish_non_exhaustive()
    }
}

impl SessionState {
    pub(crate) fn new(
        request_id: u64,
        default_method: HttpMethod,
        default_hangup_url: Option<String>,
        actions: mpsc::UnboundedSender<Event>,
        fetcher: Arc<dyn CallFlowFetcher>,
    ) -> Self {
        Self {
            request_id,
            uuid: OnceLock::new(),
            direction: OnceLock::new(),
            hangup_cause: OnceLock::new(),
            answered: AtomicBool::new(false),
            hangup_notified: AtomicBool::new(false),
            params: Mutex::new(BTreeMap::new()),
            hangup_url: Mutex::new(None),
            default_hangup_url: Mutex::new(default_hangup_url),
            default_method,
            actions,
            fetcher,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Channel `Unique-ID`, known once the handshake completed.
    pub fn uuid(&self) -> Option<&str> {
        self.uuid
            .get()
            .map(String::as_str)
    }

    pub(crate) fn set_uuid(&self, uuid: String) {
        let _ = self
            .uuid
            .set(uuid);
    }

    /// `true` when `event` belongs to this call.
    pub fn owns(&self, event: &Event) -> bool {
        match (self.uuid(), event.unique_id()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        }
    }

    pub fn direction(&self) -> Option<CallDirection> {
        self.direction
            .get()
            .copied()
    }

    pub(crate) fn set_direction(&self, direction: CallDirection) {
        let _ = self
            .direction
            .set(direction);
    }

    pub fn is_hungup(&self) -> bool {
        self.hangup_cause
            .get()
            .is_some()
    }

    pub fn hangup_cause(&self) -> Option<&str> {
        self.hangup_cause
            .get()
            .map(String::as_str)
    }

    /// Record the hangup cause. Only the first call has any effect.
    pub(crate) fn set_hangup_cause(&self, cause: &str) -> bool {
        self.hangup_cause
            .set(cause.to_string())
            .is_ok()
    }

    pub fn is_answered(&self) -> bool {
        self.answered
            .load(Ordering::SeqCst)
    }

    pub(crate) fn mark_answered(&self) {
        self.answered
            .store(true, Ordering::SeqCst);
    }

    pub fn param(&self, name: &str) -> Option<String> {
        lock(&self.params)
            .get(name)
            .cloned()
    }

    pub fn set_param(&self, name: &str, value: impl Into<String>) {
        lock(&self.params).insert(name.to_string(), value.into());
    }

    /// Snapshot of the session parameters.
    pub fn params(&self) -> BTreeMap<String, String> {
        lock(&self.params).clone()
    }

    /// `extra` overlaid with the session parameters; session values win.
    pub fn merged_params(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = extra.clone();
        merged.extend(self.params());
        merged
    }

    pub(crate) fn set_hangup_url(&self, url: Option<String>) {
        *lock(&self.hangup_url) = url.filter(|u| !u.is_empty());
    }

    /// Disable hangup notification for this call.
    pub(crate) fn clear_hangup_urls(&self) {
        *lock(&self.hangup_url) = None;
        *lock(&self.default_hangup_url) = None;
    }

    /// URL notified when the call ends: the call's own, else the default.
    pub fn hangup_target(&self) -> Option<String> {
        lock(&self.hangup_url)
            .clone()
            .or_else(|| lock(&self.default_hangup_url).clone())
    }

    pub fn hangup_notified(&self) -> bool {
        self.hangup_notified
            .load(Ordering::SeqCst)
    }

    /// Post the session parameters to the hangup URL in the background.
    ///
    /// Fires at most once per call. Returns `false` when nothing was sent.
    pub(crate) fn notify_hangup(&self) -> bool {
        let Some(url) = self.hangup_target() else {
            return false;
        };
        if self
            .hangup_notified
            .swap(true, Ordering::SeqCst)
        {
            return false;
        }

        let params = self.params();
        let method = self.default_method;
        let fetcher = self
            .fetcher
            .clone();
        info!("Sending hangup to {}", url);
        tokio::spawn(
            async move {
                if let Err(e) = fetcher
                    .fetch(&url, &params, method)
                    .await
                {
                    warn!("Hangup notification to {} failed: {}", url, e);
                }
            }
            .instrument(Span::current()),
        );
        true
    }

    /// Deliver `event` to the element waiting on the action queue.
    pub(crate) fn queue_action(&self, event: Event) {
        if self
            .actions
            .send(event)
            .is_err()
        {
            debug!("action queue closed, dropping event");
        }
    }
}

impl EventContext for SessionState {
    fn callback_failure(&self, event: &Event, failure: &HandlerFailure) {
        warn!(
            "[{}] {} handler failed on {}: {}",
            self.request_id,
            event
                .event_name()
                .unwrap_or("?"),
            self.uuid()
                .unwrap_or("-"),
            failure
        );
    }

    fn on_disconnect(&self) {
        debug!("[{}] connection gone, releasing action waiter", self.request_id);
        self.queue_action(Event::default());
    }
}

/// What elements use to drive the channel.
///
/// Every command checks for a hangup before it is written and after its reply
/// arrives; either check failing yields [`CallError::HungUp`].
pub struct CallControl {
    conn: EslConnection,
    state: Arc<SessionState>,
    actions: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl std::fmt::Debug for CallControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallControl")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CallControl {
    pub(crate) fn new(
        conn: EslConnection,
        state: Arc<SessionState>,
        actions: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            conn,
            state,
            actions: tokio::sync::Mutex::new(actions),
        }
    }

    pub fn connection(&self) -> &EslConnection {
        &self.conn
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Channel `Unique-ID`; empty before the handshake.
    pub fn uuid(&self) -> &str {
        self.state
            .uuid()
            .unwrap_or_default()
    }

    pub fn is_hungup(&self) -> bool {
        self.state
            .is_hungup()
    }

    fn check_hangup(&self) -> CallResult<()> {
        if self.is_hungup() {
            return Err(CallError::HungUp);
        }
        Ok(())
    }

    /// Send a simple command.
    pub async fn command(&self, command: &EslCommand) -> CallResult<EslResponse> {
        self.check_hangup()?;
        let response = self
            .conn
            .send(command)
            .await?;
        debug!("Response: {:?}", response.reply_text());
        self.check_hangup()?;
        Ok(response)
    }

    /// Execute `app` on this call's channel.
    pub async fn execute(&self, app: &str, arg: Option<&str>, event_lock: bool) -> CallResult<EslResponse> {
        self.check_hangup()?;
        debug!("Execute: {} args={:?} lock={}", app, arg, event_lock);
        let response = self
            .conn
            .execute(self.uuid(), app, arg, event_lock)
            .await?;
        self.check_hangup()?;
        Ok(response)
    }

    pub async fn answer(&self) -> CallResult<EslResponse> {
        self.execute("answer", None, false)
            .await
    }

    pub async fn pre_answer(&self) -> CallResult<EslResponse> {
        self.execute("pre_answer", None, false)
            .await
    }

    pub async fn hangup(&self, cause: &str) -> CallResult<EslResponse> {
        self.execute("hangup", Some(cause), false)
            .await
    }

    pub async fn set_var(&self, var: ChannelVariable, value: &str) -> CallResult<EslResponse> {
        let arg = format!("{}={}", var, value);
        self.execute("set", Some(&arg), false)
            .await
    }

    pub async fn unset_var(&self, var: ChannelVariable) -> CallResult<EslResponse> {
        self.execute("unset", Some(var.as_str()), false)
            .await
    }

    /// Current value of a channel variable; unset or empty is `None`.
    pub async fn get_var(&self, var: ChannelVariable) -> CallResult<Option<String>> {
        self.check_hangup()?;
        let value = self
            .conn
            .get_var(self.uuid(), var.as_str())
            .await?;
        self.check_hangup()?;
        Ok(value)
    }

    /// Block until the next action-completion event for this call.
    ///
    /// Hangup and disconnect queue a neutral event, so this never outlives the
    /// channel. A neutral event is also returned once the queue is closed or
    /// the connection is down.
    pub async fn wait_for_action(&self) -> Event {
        let mut actions = self
            .actions
            .lock()
            .await;
        tokio::select! {
            biased;
            event = actions.recv() => event.unwrap_or_default(),
            _ = self.conn.wait_disconnected() => Event::default(),
        }
    }
}
