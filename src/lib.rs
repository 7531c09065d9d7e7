//! Voicebus Core Library
//!
//! Session orchestration for a voice assistant whose wake-word, speech,
//! LLM and speaker services talk over a pub/sub bus: the bus connector,
//! topic routing, the conversation state machine and the loop tying them
//! together.

pub mod bus;
pub mod config;
pub mod orchestrator;
pub mod router;
pub mod session;
pub mod telemetry;
