use uuid::Uuid;

use super::*;
use crate::session::SessionId;

fn router() -> TopicRouter {
    TopicRouter::new(TopicMap::default(), false)
}

#[test]
fn wake_confidence_is_parsed() {
    let event = router()
        .decode("session/wake_detected", b" 0.85 \n")
        .unwrap();
    assert_eq!(event, Event::WakeDetected { confidence: 0.85 });
}

#[test]
fn wake_with_garbage_confidence_is_malformed() {
    let router = router();
    let payloads: [&[u8]; 4] = [b"loud", b"", b"NaN", b"inf"];
    for payload in payloads {
        let err = router
            .decode("session/wake_detected", payload)
            .unwrap_err();
        assert!(
            matches!(err, DecodeError::Malformed { kind: "wake_detected", .. }),
            "payload {payload:?} gave {err:?}"
        );
    }
}

#[test]
fn transcription_keeps_raw_text() {
    let event = router()
        .decode("audio/transcription", "what is gravity".as_bytes())
        .unwrap();
    assert_eq!(
        event,
        Event::Transcription {
            text: "what is gravity".into()
        }
    );
}

#[test]
fn plain_response_has_no_request_id() {
    let event = router()
        .decode("llm/response", b"Gravity pulls things together.")
        .unwrap();
    assert_eq!(
        event,
        Event::LlmResponse {
            request_id: None,
            text: "Gravity pulls things together.".into()
        }
    );
}

#[test]
fn enveloped_response_carries_request_id() {
    let event = router()
        .decode("llm/response", br#"{"request_id": 3, "text": "hi"}"#)
        .unwrap();
    assert_eq!(
        event,
        Event::LlmResponse {
            request_id: Some(RequestId(3)),
            text: "hi".into()
        }
    );
}

#[test]
fn brace_prefixed_text_falls_back_to_plain() {
    let payload = r#"{not json} but an answer"#;
    let event = router()
        .decode("llm/response", payload.as_bytes())
        .unwrap();
    assert_eq!(
        event,
        Event::LlmResponse {
            request_id: None,
            text: payload.into()
        }
    );
}

#[test]
fn speaking_flags() {
    let router = router();
    for (payload, active) in [
        ("true", true),
        ("TRUE", true),
        ("1", true),
        ("false", false),
        (" off ", false),
    ] {
        let event = router.decode("robot/speaking", payload.as_bytes()).unwrap();
        assert_eq!(event, Event::Speaking { active }, "payload {payload:?}");
    }

    let err = router.decode("robot/speaking", b"maybe").unwrap_err();
    assert_eq!(err.code(), "malformed");
}

#[test]
fn external_commands() {
    let router = router();
    assert_eq!(
        router.decode("session/command", b"cancel").unwrap(),
        Event::External(ExternalCommand::End)
    );
    assert_eq!(
        router.decode("session/command", b"end").unwrap(),
        Event::External(ExternalCommand::End)
    );
    assert_eq!(
        router.decode("session/command", b" Reset ").unwrap(),
        Event::External(ExternalCommand::Reset)
    );
    assert!(router.decode("session/command", b"reboot").is_err());
}

#[test]
fn unknown_topic_is_rejected() {
    let err = router().decode("robot/battery", b"42").unwrap_err();
    assert_eq!(err, DecodeError::UnknownTopic("robot/battery".into()));
}

#[test]
fn outbound_topics_are_not_routed() {
    let router = router();
    assert!(router.decode("session/state", b"idle").is_err());
    assert!(router.decode("llm/request", b"hello").is_err());
}

#[test]
fn invalid_utf8_is_rejected() {
    let err = router()
        .decode("audio/transcription", &[0xff, 0xfe, 0x00])
        .unwrap_err();
    assert_eq!(
        err,
        DecodeError::InvalidUtf8 {
            topic: "audio/transcription".into()
        }
    );
}

#[test]
fn custom_topic_names_route() {
    let mut topics = TopicMap::default();
    topics.wake_detected = "kitchen/wake".into();
    let router = TopicRouter::new(topics, false);

    assert!(router.decode("kitchen/wake", b"0.9").is_ok());
    assert!(router.decode("session/wake_detected", b"0.9").is_err());
    assert!(router.inbound_topics().contains(&"kitchen/wake".to_string()));
}

#[test]
fn state_and_emotion_are_retained() {
    let router = router();

    let state = router.encode(&Command::StateChanged(SessionState::Thinking));
    assert_eq!(state.topic, "session/state");
    assert_eq!(state.payload_str(), Some("thinking"));
    assert!(state.retain);

    let emotion = router.encode(&Command::Emotion(SessionState::Responding));
    assert_eq!(emotion.topic, "robot/emotion");
    assert_eq!(emotion.payload_str(), Some("talking"));
    assert!(emotion.retain);
}

fn request() -> LlmRequest {
    LlmRequest {
        request_id: RequestId(7),
        session_id: SessionId::new(Uuid::nil(), 2),
        text: "what is gravity".into(),
    }
}

#[test]
fn llm_request_is_plain_text_by_default() {
    let message = router().encode(&Command::LlmRequest(request()));
    assert_eq!(message.topic, "llm/request");
    assert_eq!(message.payload_str(), Some("what is gravity"));
    assert!(!message.retain);
}

#[test]
fn tagged_llm_request_is_json() {
    let router = TopicRouter::new(TopicMap::default(), true);
    let message = router.encode(&Command::LlmRequest(request()));

    let value: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(value["request_id"], 7);
    assert_eq!(value["session_id"], "00000000-2");
    assert_eq!(value["text"], "what is gravity");
}

#[test]
fn external_command_round_trips_through_bus() {
    let router = router();
    for command in [ExternalCommand::End, ExternalCommand::Reset] {
        let message = router.encode(&Command::External(command));
        assert!(!message.retain);
        assert_eq!(
            router.decode(&message.topic, &message.payload).unwrap(),
            Event::External(command)
        );
    }
}

#[test]
fn every_state_has_an_emotion() {
    assert_eq!(SessionState::Idle.emotion(), "sleeping");
    assert_eq!(SessionState::Active.emotion(), "listening");
    assert_eq!(SessionState::Thinking.emotion(), "thinking");
    assert_eq!(SessionState::Responding.emotion(), "talking");
}
