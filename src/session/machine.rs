use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::router::{Command, Event, ExternalCommand, LlmRequest, RequestId};
use crate::session::types::{
    DropReason, Effect, Outcome, PendingRequest, SessionId, SessionInput, SessionPolicy,
    SessionState, Step,
};
use crate::telemetry::events::{duration_to_ms, record_event_dropped, record_state_transition};

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionContext {
    id: SessionId,
    started_at: Instant,
    last_activity_at: Instant,
    pending_request: Option<PendingRequest>,
}

/// The single conversation owned by [`SessionMachine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    boot: Uuid,
    sessions_started: u64,
    requests_issued: u64,
    state: SessionState,
    context: Option<SessionContext>,
}

impl Session {
    pub fn new(boot: Uuid) -> Self {
        Self {
            boot,
            sessions_started: 0,
            requests_issued: 0,
            state: SessionState::Idle,
            context: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.context.as_ref().map(|context| context.id)
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.context.as_ref().map(|context| context.started_at)
    }

    pub fn last_activity_at(&self) -> Option<Instant> {
        self.context.as_ref().map(|context| context.last_activity_at)
    }

    pub fn pending_request(&self) -> Option<&PendingRequest> {
        self.context
            .as_ref()
            .and_then(|context| context.pending_request.as_ref())
    }

    fn invariants_hold(&self) -> bool {
        match (&self.state, &self.context) {
            (SessionState::Idle, None) => true,
            (SessionState::Thinking, Some(context)) => context.pending_request.is_some(),
            (SessionState::Active | SessionState::Responding, Some(context)) => {
                context.pending_request.is_none()
            }
            _ => false,
        }
    }

    fn on_event(
        &mut self,
        event: &Event,
        received_at: Instant,
        now: Instant,
        policy: &SessionPolicy,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        match (self.state, event) {
            (SessionState::Idle, Event::WakeDetected { confidence }) => {
                if *confidence < policy.min_wake_confidence {
                    return Outcome::Dropped(DropReason::LowConfidence);
                }
                self.begin(now, policy, effects);
                Outcome::Accepted
            }
            (SessionState::Idle, _) => Outcome::Dropped(DropReason::NoSession),
            (_, Event::External(ExternalCommand::End)) => {
                self.finish(true, effects);
                Outcome::Accepted
            }
            (_, Event::External(ExternalCommand::Reset)) => {
                self.finish(true, effects);
                self.begin(now, policy, effects);
                Outcome::Accepted
            }
            (SessionState::Active, Event::Transcription { text }) => {
                self.on_transcription(text, received_at, now, policy, effects)
            }
            (SessionState::Thinking, Event::LlmResponse { request_id, .. }) => {
                self.on_response(*request_id, received_at, now, policy, effects)
            }
            (SessionState::Responding, Event::Speaking { active: true }) => {
                self.touch(now);
                self.arm(policy, effects);
                Outcome::Accepted
            }
            (SessionState::Responding, Event::Speaking { active: false }) => {
                if policy.follow_up {
                    self.touch(now);
                    self.enter(SessionState::Active, effects);
                    self.arm(policy, effects);
                } else {
                    self.finish(true, effects);
                }
                Outcome::Accepted
            }
            (_, Event::WakeDetected { .. }) => Outcome::Dropped(DropReason::AlreadyActive),
            (_, Event::LlmResponse { .. }) => Outcome::Dropped(DropReason::StaleRequest),
            _ => Outcome::Dropped(DropReason::UnexpectedInState),
        }
    }

    fn on_transcription(
        &mut self,
        text: &str,
        received_at: Instant,
        now: Instant,
        policy: &SessionPolicy,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let Some(context) = self.context.as_ref() else {
            return Outcome::Dropped(DropReason::NoSession);
        };
        if received_at < context.started_at {
            return Outcome::Dropped(DropReason::StaleSession);
        }
        let session_id = context.id;

        self.touch(now);

        let question = text.trim();
        if question.is_empty() {
            self.arm(policy, effects);
            return Outcome::Accepted;
        }

        if policy.is_goodbye(question) {
            self.finish(true, effects);
            return Outcome::Accepted;
        }

        self.requests_issued += 1;
        let request_id = RequestId(self.requests_issued);
        if let Some(context) = self.context.as_mut() {
            context.pending_request = Some(PendingRequest {
                id: request_id,
                question: question.to_string(),
                issued_at: now,
            });
        }

        effects.push(Effect::Publish(Command::LlmRequest(LlmRequest {
            request_id,
            session_id,
            text: question.to_string(),
        })));
        self.enter(SessionState::Thinking, effects);
        self.arm(policy, effects);
        Outcome::Accepted
    }

    fn on_response(
        &mut self,
        request_id: Option<RequestId>,
        received_at: Instant,
        now: Instant,
        policy: &SessionPolicy,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let Some(pending) = self.pending_request() else {
            return Outcome::Dropped(DropReason::StaleRequest);
        };

        let correlated = match request_id {
            Some(id) => id == pending.id,
            None => received_at >= pending.issued_at,
        };
        if !correlated {
            return Outcome::Dropped(DropReason::StaleRequest);
        }

        self.touch(now);
        if let Some(context) = self.context.as_mut() {
            context.pending_request = None;
        }
        self.enter(SessionState::Responding, effects);
        self.arm(policy, effects);
        Outcome::Accepted
    }

    fn on_timeout(
        &mut self,
        session_id: SessionId,
        now: Instant,
        policy: &SessionPolicy,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let Some(context) = self.context.as_ref() else {
            return Outcome::Dropped(DropReason::StaleTimer);
        };
        if context.id != session_id {
            return Outcome::Dropped(DropReason::StaleTimer);
        }
        // A window past the clock's range never elapses.
        match context.last_activity_at.checked_add(policy.idle_timeout) {
            Some(deadline) if now >= deadline => {}
            _ => return Outcome::Dropped(DropReason::StaleTimer),
        }

        // The scheduler already disarmed the deadline that fired.
        self.finish(false, effects);
        Outcome::Accepted
    }

    fn begin(&mut self, now: Instant, policy: &SessionPolicy, effects: &mut Vec<Effect>) {
        self.sessions_started += 1;
        self.context = Some(SessionContext {
            id: SessionId::new(self.boot, self.sessions_started),
            started_at: now,
            last_activity_at: now,
            pending_request: None,
        });
        self.enter(SessionState::Active, effects);
        self.arm(policy, effects);
    }

    fn finish(&mut self, cancel_timer: bool, effects: &mut Vec<Effect>) {
        if let Some(context) = self.context.take() {
            if cancel_timer {
                effects.push(Effect::CancelTimer {
                    session_id: context.id,
                });
            }
        }
        self.enter(SessionState::Idle, effects);
    }

    fn enter(&mut self, state: SessionState, effects: &mut Vec<Effect>) {
        self.state = state;
        effects.push(Effect::Publish(Command::StateChanged(state)));
    }

    fn arm(&self, policy: &SessionPolicy, effects: &mut Vec<Effect>) {
        if let Some(context) = &self.context {
            effects.push(Effect::ArmTimer {
                session_id: context.id,
                after: policy.idle_timeout,
            });
        }
    }

    fn touch(&mut self, now: Instant) {
        if let Some(context) = self.context.as_mut() {
            context.last_activity_at = context.last_activity_at.max(now);
        }
    }
}

/// Pure reduction of one input against a session value.
pub fn transition(
    session: Session,
    input: &SessionInput,
    now: Instant,
    policy: &SessionPolicy,
) -> (Session, Step) {
    let mut next = session;
    let from = next.state;
    let mut effects = Vec::new();

    let outcome = match input {
        SessionInput::Bus { event, received_at } => {
            next.on_event(event, *received_at, now, policy, &mut effects)
        }
        SessionInput::IdleTimeout { session_id } => {
            next.on_timeout(*session_id, now, policy, &mut effects)
        }
    };
    debug_assert!(next.invariants_hold(), "session invariants violated: {next:?}");

    let step = Step {
        from,
        to: next.state,
        effects,
        outcome,
    };
    (next, step)
}

/// Read-only view handed to status readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<SessionId>,
    pub pending_request: Option<RequestId>,
    pub active_for_ms: Option<u64>,
    pub idle_for_ms: Option<u64>,
    pub captured_at_ms: u64,
}

/// Exclusive owner of the process-wide session.
#[derive(Debug)]
pub struct SessionMachine {
    session: Session,
    policy: SessionPolicy,
}

impl SessionMachine {
    /// Always starts Idle; nothing from a previous run is recovered.
    pub fn new(policy: SessionPolicy) -> Self {
        Self::with_session(Session::new(Uuid::new_v4()), policy)
    }

    pub fn with_session(session: Session, policy: SessionPolicy) -> Self {
        Self { session, policy }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.session_id()
    }

    pub fn apply(&mut self, input: SessionInput, now: Instant) -> Step {
        let before = self.session.session_id();
        let (next, step) = transition(self.session.clone(), &input, now, &self.policy);
        self.session = next;
        let after = self.session.session_id();

        match step.outcome {
            Outcome::Accepted if step.from != step.to || before != after => {
                let session_label = after
                    .or(before)
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                record_state_transition(&session_label, step.from, step.to, input.label());
            }
            Outcome::Accepted => {}
            Outcome::Dropped(reason) => {
                record_event_dropped(input.label(), reason, step.from);
            }
        }

        step
    }

    /// Ends a live session so its Idle notification can be flushed.
    pub fn shutdown(&mut self) -> Step {
        let from = self.session.state();
        let mut effects = Vec::new();
        if let Some(session_id) = self.session.session_id() {
            self.session.finish(true, &mut effects);
            record_state_transition(&session_id.to_string(), from, SessionState::Idle, "shutdown");
        }

        Step {
            from,
            to: self.session.state(),
            effects,
            outcome: Outcome::Accepted,
        }
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            state: self.session.state(),
            session_id: self.session.session_id(),
            pending_request: self.session.pending_request().map(|pending| pending.id),
            active_for_ms: self
                .session
                .started_at()
                .map(|started| duration_to_ms(now.saturating_duration_since(started))),
            idle_for_ms: self
                .session
                .last_activity_at()
                .map(|last| duration_to_ms(now.saturating_duration_since(last))),
            captured_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(duration_to_ms)
                .unwrap_or(0),
        }
    }
}
