//! Event handler registry and the worker pool handlers run on

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

use crate::event::{EslEventType, Event};

/// Error type returned by event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by an event handler.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Registered event handler, sharing the connection's context.
pub type Handler<C> = Arc<dyn Fn(Arc<C>, Event) -> HandlerFuture + Send + Sync>;

/// Why a handler did not complete normally.
#[derive(Debug)]
pub enum HandlerFailure {
    /// The handler returned an error.
    Error(HandlerError),
    /// The handler panicked; the payload message when it was a string.
    Panic(String),
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFailure::Error(e) => write!(f, "handler error: {}", e),
            HandlerFailure::Panic(msg) => write!(f, "handler panicked: {}", msg),
        }
    }
}

/// Hooks the connection calls on the owner of its handlers.
///
/// The failure hooks default to logging only.
pub trait EventContext: Send + Sync + 'static {
    /// A handler failed or panicked while processing `event`.
    fn callback_failure(&self, event: &Event, failure: &HandlerFailure) {
        warn!(
            "event {} handler failed: {}",
            event
                .event_name()
                .unwrap_or("?"),
            failure
        );
    }

    /// A frame arrived with a content type the connection does not handle.
    fn unknown_content(&self, event: &Event) {
        trace!("unknown content type {:?}", event.content_type());
    }

    /// The dispatch loop ended. Called once, after the connection is marked
    /// disconnected.
    fn on_disconnect(&self) {}
}

/// Maps event types to handlers, with a fallback for everything else.
pub struct HandlerRegistry<C> {
    handlers: HashMap<EslEventType, Handler<C>>,
    fallback: Handler<C>,
}

impl<C: EventContext> HandlerRegistry<C> {
    /// Empty registry; unmatched events are dropped.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(|_: Arc<C>, _: Event| -> HandlerFuture { Box::pin(async { Ok(()) }) }),
        }
    }

    /// Register `handler` for events named `kind`. Replaces any earlier one.
    pub fn on<F, Fut>(mut self, kind: EslEventType, handler: F) -> Self
    where
        F: Fn(Arc<C>, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers
            .insert(
                kind,
                Arc::new(move |ctx: Arc<C>, event: Event| -> HandlerFuture {
                    Box::pin(handler(ctx, event))
                }),
            );
        self
    }

    /// Handler for events with no registered type (including unknown names).
    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<C>, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.fallback = Arc::new(move |ctx: Arc<C>, event: Event| -> HandlerFuture {
            Box::pin(handler(ctx, event))
        });
        self
    }

    /// `true` when a dedicated handler exists for `kind`.
    pub fn handles(&self, kind: EslEventType) -> bool {
        self.handlers
            .contains_key(&kind)
    }

    /// Handler for `event`, resolved from its `Event-Name` (case-insensitive).
    pub fn resolve(&self, event: &Event) -> Handler<C> {
        event
            .event_type()
            .and_then(|kind| {
                self.handlers
                    .get(&kind)
            })
            .unwrap_or(&self.fallback)
            .clone()
    }
}

impl<C: EventContext> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Where event handlers run.
///
/// Handlers are spawned on `handle`. With a non-zero size, at most that many
/// run at once and dispatch waits for a free slot.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    handle: Handle,
    permits: Option<Arc<Semaphore>>,
}

impl WorkerPool {
    /// Pool on an explicit runtime. `size` 0 means unbounded.
    pub fn new(handle: Handle, size: usize) -> Self {
        let permits = (size > 0).then(|| Arc::new(Semaphore::new(size)));
        Self { handle, permits }
    }

    /// Pool on the runtime of the calling task.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current(size: usize) -> Self {
        Self::new(Handle::current(), size)
    }

    /// Runtime handle tasks are spawned on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn `task`, waiting first for a free slot when the pool is bounded.
    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match &self.permits {
            Some(sem) => match sem
                .clone()
                .acquire_owned()
                .await
            {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        self.handle
            .spawn(async move {
                task.await;
                drop(permit);
            });
    }
}

/// Run the handler resolved for `event` on `pool`.
///
/// Errors and panics are routed to [`EventContext::callback_failure`].
pub(crate) async fn dispatch<C: EventContext>(
    pool: &WorkerPool,
    registry: &HandlerRegistry<C>,
    ctx: &Arc<C>,
    event: Event,
) {
    let handler = registry.resolve(&event);
    let ctx = ctx.clone();

    pool.spawn(async move {
        let call = {
            let ctx = ctx.clone();
            let event = event.clone();
            async move { handler(ctx, event).await }
        };
        let failure = match AssertUnwindSafe(call)
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return,
            Ok(Err(e)) => HandlerFailure::Error(e),
            Err(payload) => HandlerFailure::Panic(panic_message(payload.as_ref())),
        };
        ctx.callback_failure(&event, &failure);
    })
    .await;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
