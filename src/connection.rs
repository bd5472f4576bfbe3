//! Event socket connection: command/reply correlation and the background dispatch loop

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use crate::{
    command::{AppCommand, EslCommand, EslResponse, ResponseKind},
    constants::MAX_LINES_PER_EVENT,
    dispatch::{dispatch, EventContext, HandlerRegistry, WorkerPool},
    error::{EslError, EslResult},
    event::{Event, EventFormat},
    protocol::{EventReader, Frame},
};

/// Connection status
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// The dispatch loop is running.
    Connected,
    /// The connection is unusable.
    Disconnected(DisconnectReason),
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Clean EOF, or EOF in the middle of a frame.
    ConnectionClosed,
    /// A header block exceeded the line cap.
    FramingLimit,
    /// Socket error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// [`EslConnection::disconnect`] was called.
    ClientRequested,
    /// The dispatch loop panicked.
    ReaderPanicked,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::FramingLimit => write!(f, "max lines per event reached"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
            DisconnectReason::ReaderPanicked => write!(f, "reader task panicked"),
        }
    }
}

impl From<&EslError> for DisconnectReason {
    fn from(err: &EslError) -> Self {
        match err {
            EslError::ConnectionClosed => DisconnectReason::ConnectionClosed,
            EslError::FramingLimit { .. } => DisconnectReason::FramingLimit,
            other => DisconnectReason::IoError(other.to_string()),
        }
    }
}

/// Options fixed when a connection starts.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Event encoding this connection subscribes with. Default: JSON.
    pub event_format: EventFormat,
    /// Header line cap per event. Default: 1000.
    pub max_lines_per_event: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            event_format: EventFormat::default(),
            max_lines_per_event: MAX_LINES_PER_EVENT,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared state between EslConnection handles and the reader task
struct SharedState {
    connected: AtomicBool,
    /// Set by a disconnect notice, never cleared.
    closing: AtomicBool,
    /// Command lock: whoever holds the receiver owns the next reply.
    replies: Mutex<mpsc::Receiver<Event>>,
    reply_tx: mpsc::Sender<Event>,
    /// Held only while writing.
    writer: Mutex<BoxedWriter>,
    reader_task: OnceLock<AbortHandle>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_format: EventFormat,
}

impl SharedState {
    /// Hand a reply to the issuer holding the command lock.
    ///
    /// Never blocks the loop. With the slot already full the reply has no
    /// issuer waiting for it and is dropped; the next issuer drains the slot
    /// before writing.
    fn push_reply(&self, event: Event) {
        match self
            .reply_tx
            .try_send(event)
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("[RECV] reply slot full, dropping unsolicited reply");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Unblock a waiter with the neutral event. A reply already in the slot
    /// serves the same purpose.
    fn push_neutral(&self) {
        let _ = self
            .reply_tx
            .try_send(Event::default());
    }

    fn mark_disconnected(&self, reason: DisconnectReason) {
        self.connected
            .store(false, Ordering::SeqCst);
        self.status_tx
            .send_if_modified(|status| {
                if *status == ConnectionStatus::Connected {
                    *status = ConnectionStatus::Disconnected(reason);
                    true
                } else {
                    false
                }
            });
    }
}

/// Event socket connection handle (Clone + Send)
///
/// Commands are strictly serialized: one command in flight, and the next
/// reply read off the socket always belongs to it. Unsolicited events are
/// dispatched to a [`HandlerRegistry`] on a [`WorkerPool`].
#[derive(Clone)]
pub struct EslConnection {
    shared: Arc<SharedState>,
}

impl std::fmt::Debug for EslConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslConnection")
            .field("connected", &self.is_connected())
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl EslConnection {
    /// Take ownership of `stream` and start the dispatch loop on `pool`.
    pub fn start<S, C>(
        stream: S,
        options: ConnectionOptions,
        ctx: Arc<C>,
        registry: Arc<HandlerRegistry<C>>,
        pool: WorkerPool,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        C: EventContext,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (status_tx, _) = watch::channel(ConnectionStatus::Connected);

        let shared = Arc::new(SharedState {
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            replies: Mutex::new(reply_rx),
            reply_tx,
            writer: Mutex::new(Box::new(write_half)),
            reader_task: OnceLock::new(),
            status_tx,
            event_format: options.event_format,
        });

        let reader = EventReader::new(
            BufReader::new(read_half),
            options.event_format,
            options.max_lines_per_event,
        );
        let task = pool
            .handle()
            .spawn(reader_loop(reader, shared.clone(), ctx, registry, pool.clone()));
        let _ = shared
            .reader_task
            .set(task.abort_handle());

        debug!("[CONNECT] connection started");
        EslConnection { shared }
    }

    /// `true` until the loop ends or [`disconnect`](Self::disconnect) is called.
    pub fn is_connected(&self) -> bool {
        self.shared
            .connected
            .load(Ordering::SeqCst)
    }

    /// `true` once the peer announced it is closing.
    pub fn is_closing(&self) -> bool {
        self.shared
            .closing
            .load(Ordering::SeqCst)
    }

    /// Event format chosen at start.
    pub fn event_format(&self) -> EventFormat {
        self.shared
            .event_format
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared
            .status_tx
            .borrow()
            .clone()
    }

    /// Wait until the connection is disconnected and return why.
    pub async fn wait_disconnected(&self) -> DisconnectReason {
        let mut rx = self
            .shared
            .status_tx
            .subscribe();
        loop {
            if let ConnectionStatus::Disconnected(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx
                .changed()
                .await
                .is_err()
            {
                return DisconnectReason::ConnectionClosed;
            }
        }
    }

    /// Send a simple command and wait for its reply.
    pub async fn send(&self, command: &EslCommand) -> EslResult<EslResponse> {
        let wire = command.to_wire_format()?;
        debug!("Sending command: {}", wire.trim_end());
        self.roundtrip(wire, command.response_kind())
            .await
    }

    /// Execute an application on a channel and wait for the `command/reply`.
    pub async fn sendmsg(&self, app: &AppCommand) -> EslResult<EslResponse> {
        let wire = app.to_wire_format()?;
        debug!("Sending command: sendmsg execute {}", app.name());
        self.roundtrip(wire, ResponseKind::Command)
            .await
    }

    /// Neutral response once the peer announced it is closing,
    /// [`EslError::NotConnected`] once the loop has ended.
    fn check_usable(&self, kind: ResponseKind) -> EslResult<Option<EslResponse>> {
        if self.is_closing() {
            debug!("connection closing, returning neutral response");
            return Ok(Some(EslResponse::neutral(kind)));
        }
        if !self.is_connected() {
            return Err(EslError::NotConnected);
        }
        Ok(None)
    }

    /// Write one command and take the next reply.
    ///
    /// The command lock is held from the stale-reply drain to the reply, so
    /// concurrent issuers queue up and each gets its own reply. A waiter
    /// whose connection goes away gets the neutral response.
    async fn roundtrip(&self, wire: String, kind: ResponseKind) -> EslResult<EslResponse> {
        if let Some(neutral) = self.check_usable(kind)? {
            return Ok(neutral);
        }

        let mut replies = self
            .shared
            .replies
            .lock()
            .await;

        // The loop may have ended while we queued on the lock.
        if let Some(neutral) = self.check_usable(kind)? {
            return Ok(neutral);
        }

        while let Ok(stale) = replies.try_recv() {
            trace!("discarding stale reply: {:?}", stale.header("Reply-Text"));
        }

        {
            let mut writer = self
                .shared
                .writer
                .lock()
                .await;
            writer
                .write_all(wire.as_bytes())
                .await?;
            writer
                .flush()
                .await?;
        }

        let event = tokio::select! {
            biased;
            reply = replies.recv() => reply.unwrap_or_default(),
            reason = self.wait_disconnected() => {
                debug!("connection lost while waiting for reply: {}", reason);
                Event::default()
            }
        };
        drop(replies);

        trace!("[RECV] reply for {:?}: {:?}", kind, event.header("Reply-Text"));
        Ok(EslResponse::new(kind, event))
    }

    /// Close the socket and stop the dispatch loop. Idempotent.
    ///
    /// A command waiting for its reply returns the neutral response.
    pub async fn disconnect(&self) {
        info!("Client requested disconnect");
        {
            let mut writer = self
                .shared
                .writer
                .lock()
                .await;
            let _ = writer
                .shutdown()
                .await;
        }
        if let Some(task) = self
            .shared
            .reader_task
            .get()
        {
            task.abort();
        }
        self.shared
            .push_neutral();
        self.shared
            .mark_disconnected(DisconnectReason::ClientRequested);
    }

    /// Outbound handshake. Returns the channel data carried by the reply.
    pub async fn connect(&self) -> EslResult<Event> {
        let response = self
            .send(&EslCommand::Connect)
            .await?;
        let refused = response
            .reply_text()
            .is_some_and(|t| t.starts_with("-ERR"));
        if response.is_neutral() || refused {
            return Err(EslError::ConnectFailed {
                reply_text: response
                    .reply_text()
                    .unwrap_or("no reply")
                    .to_string(),
            });
        }
        debug!("[CONNECT] received channel data");
        Ok(response.into_event())
    }

    /// Execute API command. Blocks until FreeSWITCH completes the command.
    pub async fn api(&self, command: &str) -> EslResult<EslResponse> {
        self.send(&EslCommand::Api {
            command: command.to_string(),
        })
        .await
    }

    /// Execute background API command; the result arrives as `BACKGROUND_JOB`.
    pub async fn bgapi(&self, command: &str) -> EslResult<EslResponse> {
        self.send(&EslCommand::BgApi {
            command: command.to_string(),
        })
        .await
    }

    /// Subscribe to a space-separated list of events.
    pub async fn event_subscribe(&self, format: EventFormat, events: &str) -> EslResult<EslResponse> {
        self.send(&EslCommand::Event {
            format,
            events: events.to_string(),
        })
        .await
    }

    /// Subscribe to all events of this socket's channel.
    pub async fn myevents(&self) -> EslResult<EslResponse> {
        self.send(&EslCommand::MyEvents)
            .await
    }

    /// Only deliver events whose `header` equals `value`.
    pub async fn filter(&self, header: &str, value: &str) -> EslResult<EslResponse> {
        self.send(&EslCommand::Filter {
            header: header.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Keep the socket open after the channel hangs up.
    pub async fn linger(&self) -> EslResult<EslResponse> {
        self.send(&EslCommand::Linger)
            .await
    }

    /// Cancel linger mode.
    pub async fn nolinger(&self) -> EslResult<EslResponse> {
        self.send(&EslCommand::NoLinger)
            .await
    }

    /// Resume the dialplan when the socket goes away.
    pub async fn resume(&self) -> EslResult<EslResponse> {
        self.send(&EslCommand::Resume)
            .await
    }

    /// Ask the switch to close the socket.
    pub async fn exit(&self) -> EslResult<EslResponse> {
        self.send(&EslCommand::Exit)
            .await
    }

    /// Execute application `app` on channel `uuid`.
    pub async fn execute(
        &self,
        uuid: &str,
        app: &str,
        arg: Option<&str>,
        event_lock: bool,
    ) -> EslResult<EslResponse> {
        let mut cmd = AppCommand::new(app)
            .uuid(uuid)
            .event_lock(event_lock);
        if let Some(arg) = arg {
            cmd = cmd.arg(arg);
        }
        self.sendmsg(&cmd)
            .await
    }

    /// Answer the channel.
    pub async fn answer(&self, uuid: &str) -> EslResult<EslResponse> {
        self.execute(uuid, "answer", None, false)
            .await
    }

    /// Hang up the channel with `cause` (e.g. `NORMAL_CLEARING`).
    pub async fn hangup(&self, uuid: &str, cause: &str) -> EslResult<EslResponse> {
        self.execute(uuid, "hangup", Some(cause), false)
            .await
    }

    /// Set a channel variable.
    pub async fn set_var(&self, uuid: &str, name: &str, value: &str) -> EslResult<EslResponse> {
        let arg = format!("{}={}", name, value);
        self.execute(uuid, "set", Some(&arg), false)
            .await
    }

    /// Unset a channel variable.
    pub async fn unset_var(&self, uuid: &str, name: &str) -> EslResult<EslResponse> {
        self.execute(uuid, "unset", Some(name), false)
            .await
    }

    /// Read a channel variable with `uuid_getvar`.
    ///
    /// `_undef_`, `-ERR` and empty results are `None`.
    pub async fn get_var(&self, uuid: &str, name: &str) -> EslResult<Option<String>> {
        let response = self
            .api(&format!("uuid_getvar {} {}", uuid, name))
            .await?;
        Ok(response
            .body()
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != "_undef_" && !v.starts_with("-ERR"))
            .map(str::to_string))
    }
}

/// Background reader loop
async fn reader_loop<R, C>(
    reader: EventReader<R>,
    shared: Arc<SharedState>,
    ctx: Arc<C>,
    registry: Arc<HandlerRegistry<C>>,
    pool: WorkerPool,
) where
    R: tokio::io::AsyncBufRead + Unpin + Send,
    C: EventContext,
{
    let result =
        AssertUnwindSafe(reader_loop_inner(reader, &shared, &ctx, &registry, &pool)).catch_unwind();
    let reason = match result.await {
        Ok(reason) => reason,
        Err(_) => {
            error!("reader task panicked");
            DisconnectReason::ReaderPanicked
        }
    };

    info!("Dispatch loop ended: {}", reason);
    shared.mark_disconnected(reason);
    shared.push_neutral();
    ctx.on_disconnect();
}

async fn reader_loop_inner<R, C>(
    mut reader: EventReader<R>,
    shared: &SharedState,
    ctx: &Arc<C>,
    registry: &HandlerRegistry<C>,
    pool: &WorkerPool,
) -> DisconnectReason
where
    R: tokio::io::AsyncBufRead + Unpin + Send,
    C: EventContext,
{
    loop {
        match reader
            .read_frame()
            .await
        {
            Ok(Frame::Reply(event)) => shared.push_reply(event),
            Ok(Frame::Event(event)) => {
                let named = event
                    .event_name()
                    .is_some_and(|n| !n.is_empty());
                if named {
                    trace!("[RECV] event {}", event.event_name().unwrap_or_default());
                    dispatch(pool, registry, ctx, event).await;
                }
            }
            Ok(Frame::Disconnect) => {
                info!("Received disconnect notice from server");
                shared
                    .closing
                    .store(true, Ordering::SeqCst);
            }
            Ok(Frame::Unknown(event)) => ctx.unknown_content(&event),
            Err(e) if e.is_fatal() => {
                warn!("Read error: {}", e);
                return DisconnectReason::from(&e);
            }
            Err(e) => {
                warn!("Skipping malformed frame: {}", e);
            }
        }
        tokio::task::yield_now().await;
    }
}
