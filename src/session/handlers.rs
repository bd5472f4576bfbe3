//! Event handlers feeding a call session's action queue

use std::sync::Arc;

use tracing::{debug, info};

use super::control::SessionState;
use crate::channel::CallStatus;
use crate::constants::CONFERENCE_MAINTENANCE_SUBCLASS;
use crate::dispatch::{HandlerError, HandlerRegistry};
use crate::event::{EslEventType, Event};
use crate::headers::EventHeader;
use crate::variables::ChannelVariable;

/// Applications whose completion an element may block on.
pub const WAIT_FOR_ACTIONS: &[&str] = &[
    "playback",
    "record",
    "play_and_get_digits",
    "bridge",
    "say",
    "sleep",
    "speak",
    "conference",
    "park",
];

/// Handlers every call session registers on its connection.
pub(crate) fn registry() -> HandlerRegistry<SessionState> {
    HandlerRegistry::new()
        .on(EslEventType::ChannelExecuteComplete, on_channel_execute_complete)
        .on(EslEventType::ChannelHangup, on_channel_hangup)
        .on(EslEventType::Custom, on_custom)
}

async fn on_channel_execute_complete(state: Arc<SessionState>, event: Event) -> Result<(), HandlerError> {
    if !state.owns(&event) {
        return Ok(());
    }
    let app = event
        .typed_header(EventHeader::Application)
        .unwrap_or_default();
    if !WAIT_FOR_ACTIONS.contains(&app) {
        return Ok(());
    }

    if event.channel_variable(ChannelVariable::TransferProgress) == Some("true") {
        debug!("{} completed during transfer", app);
        state.queue_action(Event::default());
    } else {
        state.queue_action(event);
    }
    Ok(())
}

async fn on_channel_hangup(state: Arc<SessionState>, event: Event) -> Result<(), HandlerError> {
    if !state.owns(&event) {
        return Ok(());
    }
    let cause = event
        .hangup_cause()
        .unwrap_or("NORMAL_CLEARING");
    if state.set_hangup_cause(cause) {
        info!(
            "Event: channel {} has hung up ({})",
            state
                .uuid()
                .unwrap_or_default(),
            cause
        );
        state.set_param("HangupCause", cause);
        state.set_param("CallStatus", CallStatus::Completed.as_str());
        state.notify_hangup();
    }
    state.queue_action(Event::default());
    Ok(())
}

async fn on_custom(state: Arc<SessionState>, event: Event) -> Result<(), HandlerError> {
    let joined = event.event_subclass() == Some(CONFERENCE_MAINTENANCE_SUBCLASS)
        && event.typed_header(EventHeader::Action) == Some("add-member")
        && state.owns(&event);
    if joined {
        debug!(
            "joined conference as member {}",
            event
                .typed_header(EventHeader::MemberId)
                .unwrap_or("?")
        );
        state.queue_action(event);
    }
    Ok(())
}
