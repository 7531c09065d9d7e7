//! 主题路由：topic + payload 与强类型事件/命令之间的映射。

pub mod error;
pub mod types;

pub use error::DecodeError;
pub use types::{Command, Event, EventKind, ExternalCommand, LlmRequest, RequestId};

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bus::OutboundMessage;
use crate::config::TopicMap;
use crate::session::SessionState;

/// LLM answer carrying an explicit correlation id.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    request_id: u64,
    text: String,
}

#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    request_id: u64,
    session_id: String,
    text: &'a str,
}

/// Stateless mapping between bus topics and typed messages.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    topics: TopicMap,
    routes: HashMap<String, EventKind>,
    tag_requests: bool,
}

impl TopicRouter {
    pub fn new(topics: TopicMap, tag_requests: bool) -> Self {
        let routes = HashMap::from([
            (topics.wake_detected.clone(), EventKind::WakeDetected),
            (topics.transcription.clone(), EventKind::Transcription),
            (topics.llm_response.clone(), EventKind::LlmResponse),
            (topics.speaking.clone(), EventKind::Speaking),
            (topics.command.clone(), EventKind::External),
        ]);

        Self {
            topics,
            routes,
            tag_requests,
        }
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    pub fn inbound_topics(&self) -> Vec<String> {
        self.topics.inbound()
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Event, DecodeError> {
        let kind = self
            .routes
            .get(topic)
            .copied()
            .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;

        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8 {
            topic: topic.to_string(),
        })?;

        match kind {
            EventKind::WakeDetected => decode_confidence(text),
            EventKind::Transcription => Ok(Event::Transcription {
                text: text.to_string(),
            }),
            EventKind::LlmResponse => Ok(decode_response(text)),
            EventKind::Speaking => decode_speaking(text),
            EventKind::External => ExternalCommand::parse(text)
                .map(Event::External)
                .ok_or_else(|| DecodeError::Malformed {
                    kind: kind.as_str(),
                    reason: format!("unknown command {:?}", text.trim()),
                }),
        }
    }

    pub fn encode(&self, command: &Command) -> OutboundMessage {
        match command {
            Command::StateChanged(state) => OutboundMessage {
                topic: self.topics.state.clone(),
                payload: Bytes::from_static(state.as_str().as_bytes()),
                retain: true,
            },
            Command::Emotion(state) => OutboundMessage {
                topic: self.topics.emotion.clone(),
                payload: Bytes::from_static(state.emotion().as_bytes()),
                retain: true,
            },
            Command::LlmRequest(request) => OutboundMessage {
                topic: self.topics.llm_request.clone(),
                payload: self.encode_request(request),
                retain: false,
            },
            Command::External(command) => OutboundMessage {
                topic: self.topics.command.clone(),
                payload: Bytes::from_static(command.as_str().as_bytes()),
                retain: false,
            },
        }
    }

    fn encode_request(&self, request: &LlmRequest) -> Bytes {
        if !self.tag_requests {
            return Bytes::from(request.text.clone());
        }

        let envelope = RequestEnvelope {
            request_id: request.request_id.0,
            session_id: request.session_id.to_string(),
            text: &request.text,
        };
        match serde_json::to_vec(&envelope) {
            Ok(encoded) => Bytes::from(encoded),
            Err(_) => Bytes::from(request.text.clone()),
        }
    }
}

fn decode_confidence(text: &str) -> Result<Event, DecodeError> {
    let malformed = |reason: String| DecodeError::Malformed {
        kind: EventKind::WakeDetected.as_str(),
        reason,
    };

    let confidence: f32 = text
        .trim()
        .parse()
        .map_err(|_| malformed(format!("{:?} is not a number", text.trim())))?;
    if !confidence.is_finite() {
        return Err(malformed("confidence must be finite".to_string()));
    }

    Ok(Event::WakeDetected { confidence })
}

fn decode_response(text: &str) -> Event {
    if text.trim_start().starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<ResponseEnvelope>(text) {
            return Event::LlmResponse {
                request_id: Some(RequestId(envelope.request_id)),
                text: envelope.text,
            };
        }
    }

    Event::LlmResponse {
        request_id: None,
        text: text.to_string(),
    }
}

fn decode_speaking(text: &str) -> Result<Event, DecodeError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(Event::Speaking { active: true }),
        "false" | "0" | "off" => Ok(Event::Speaking { active: false }),
        other => Err(DecodeError::Malformed {
            kind: EventKind::Speaking.as_str(),
            reason: format!("expected true/false, got {other:?}"),
        }),
    }
}

impl SessionState {
    /// Face shown by the display peer for this state.
    pub fn emotion(&self) -> &'static str {
        match self {
            SessionState::Idle => "sleeping",
            SessionState::Active => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Responding => "talking",
        }
    }
}

#[cfg(test)]
mod tests;
