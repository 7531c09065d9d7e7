use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::ConnectionState;
use crate::router::DecodeError;
use crate::session::{DropReason, SessionState};

pub(crate) const TARGET_SESSION: &str = "session_machine";
pub(crate) const TARGET_ROUTER: &str = "topic_router";
pub(crate) const TARGET_BUS: &str = "mqtt_bus";
pub(crate) const TARGET_ORCHESTRATOR: &str = "session_orchestrator";

pub(crate) const EVENT_TRANSITION: &str = "session_transition";
pub(crate) const EVENT_DROPPED: &str = "session_event_dropped";
pub(crate) const EVENT_DECODE_FAILED: &str = "bus_decode_failed";
pub(crate) const EVENT_CONNECTION: &str = "bus_connection";
pub(crate) const EVENT_PUBLISH_DROPPED: &str = "bus_publish_dropped";
pub(crate) const EVENT_LOOP_STATS: &str = "orchestrator_stats";

#[derive(Debug, Serialize)]
pub struct StateTransitionEvent<'a> {
    pub session_id: &'a str,
    pub from: SessionState,
    pub to: SessionState,
    pub trigger: &'a str,
}

#[derive(Debug, Serialize)]
pub struct EventDroppedEvent<'a> {
    pub input: &'a str,
    pub reason: &'static str,
    pub state: SessionState,
}

#[derive(Debug, Serialize)]
pub struct ConnectionEvent<'a> {
    pub broker: &'a str,
    pub state: &'static str,
    pub attempt: u32,
}

/// Counters reported when the orchestrator loop exits.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub received: u64,
    pub decode_failures: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub published: u64,
    pub timeouts: u64,
    pub uptime_ms: u64,
}

pub fn record_state_transition(
    session_id: &str,
    from: SessionState,
    to: SessionState,
    trigger: &str,
) {
    let event = StateTransitionEvent {
        session_id,
        from,
        to,
        trigger,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET_SESSION,
            event = EVENT_TRANSITION,
            session_id = event.session_id,
            from = %from,
            to = %to,
            trigger = event.trigger,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET_SESSION,
            event = EVENT_TRANSITION,
            %err,
            "failed to encode transition event"
        ),
    }
}

pub fn record_event_dropped(input: &str, reason: DropReason, state: SessionState) {
    let event = EventDroppedEvent {
        input,
        reason: reason.as_str(),
        state,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => debug!(
            target: TARGET_SESSION,
            event = EVENT_DROPPED,
            input = event.input,
            reason = event.reason,
            state = %state,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET_SESSION,
            event = EVENT_DROPPED,
            %err,
            "failed to encode dropped event"
        ),
    }
}

pub fn record_decode_failure(topic: &str, err: &DecodeError) {
    warn!(
        target: TARGET_ROUTER,
        event = EVENT_DECODE_FAILED,
        topic,
        code = err.code(),
        %err,
        "discarding undecodable bus message"
    );
}

pub fn record_bus_connection(broker: &str, state: ConnectionState, attempt: u32) {
    let event = ConnectionEvent {
        broker,
        state: state.as_str(),
        attempt,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET_BUS,
            event = EVENT_CONNECTION,
            broker = event.broker,
            state = event.state,
            attempt = event.attempt,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET_BUS,
            event = EVENT_CONNECTION,
            %err,
            "failed to encode connection event"
        ),
    }
}

pub fn record_publish_dropped(topic: &str, reason: &str) {
    warn!(
        target: TARGET_BUS,
        event = EVENT_PUBLISH_DROPPED,
        topic,
        reason,
        "publish dropped"
    );
}

pub fn record_loop_stats(stats: &LoopStats) {
    match serde_json::to_string(stats) {
        Ok(payload) => info!(
            target: TARGET_ORCHESTRATOR,
            event = EVENT_LOOP_STATS,
            received = stats.received,
            accepted = stats.accepted,
            dropped = stats.dropped,
            published = stats.published,
            timeouts = stats.timeouts,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET_ORCHESTRATOR,
            event = EVENT_LOOP_STATS,
            %err,
            "failed to encode loop stats"
        ),
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
