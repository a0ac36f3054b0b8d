//! Core traits and types for the voice agent
//!
//! This crate provides foundational types used across all other crates:
//! - Message envelope shared by both messaging fabrics
//! - Subject and topic namespaces with publish-time validation
//! - Conversation data model (turns, sessions, wire payloads)
//! - Error taxonomy
//! - Audio frame type
//! - Observability helpers (stage names, counters, histograms)

pub mod audio;
pub mod envelope;
pub mod error;
pub mod model;
pub mod observe;
pub mod subject;

pub use audio::AudioFrame;
pub use envelope::{Envelope, WireError};
pub use error::CoreError;
pub use model::{
    BrainConstraints, BrainReply, BrainRequest, ConnectionQuality, SessionRecord, SessionStatus,
    Turn, TurnCompleted, TurnLatency, TurnRecord,
};
pub use subject::{subjects, topics, validate_subject, validate_topic};
