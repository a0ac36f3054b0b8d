//! Reasoning engine for the voice agent
//!
//! A single reasoning turn is a linear two-stage pipeline over an owned
//! state: retrieve semantically similar prior turns, then generate a reply,
//! then persist the turn and publish a conversation event. The workflow is
//! stateless and reentrant; per-session serialization is the session
//! manager's job.

pub mod backend;
pub mod embedder;
mod error;
pub mod prompt;
pub mod responder;
pub mod workflow;

pub use backend::{GenerateOptions, GenerationResult, LlmBackend, LlmConfig, OllamaBackend};
pub use embedder::{Embedder, EmbedderConfig, HttpEmbedder};
pub use error::ReasonError;
pub use prompt::{build_messages, Message, Role};
pub use responder::serve_brain_requests;
pub use workflow::{
    EventSink, Reasoner, ReasonerConfig, TurnArchive, TurnOutcome, TurnRequest, FALLBACK_REPLY,
};
