//! Subject and topic namespaces
//!
//! The ephemeral bus uses dot-separated subjects restricted to a fixed set
//! of prefixes; anything else is rejected at publish time. The durable bus
//! uses `namespace/name` topics grouped into three logical namespaces.

use crate::error::CoreError;

/// Valid subject prefixes for the ephemeral bus.
pub const VALID_SUBJECT_PREFIXES: [&str; 6] = [
    "agent.voice.",
    "agent.brain.",
    "agent.tts.",
    "agent.stt.",
    "system.health.",
    "system.service.",
];

/// Well-known ephemeral subjects.
pub mod subjects {
    pub const SESSION_STARTED: &str = "agent.voice.session.started";
    pub const TRACK_PUBLISHED: &str = "agent.voice.track.published";
    pub const BRAIN_REQUEST: &str = "agent.brain.request";
    pub const HEARTBEAT: &str = "system.health.heartbeat";
}

/// Durable topic namespaces and helpers.
pub mod topics {
    pub const NAMESPACE_EVENTS: &str = "events";
    pub const NAMESPACE_ANALYTICS: &str = "analytics";
    pub const NAMESPACE_AUDIT: &str = "audit";

    pub const CONVERSATIONS: &str = "events/conversations";
    pub const AUDIT_LOGS: &str = "audit/logs";

    /// Analytics topic for a metric category, e.g. `analytics/latency-metrics`.
    pub fn analytics(metric: &str) -> String {
        format!("{}/{}", NAMESPACE_ANALYTICS, metric)
    }

    /// Companion dead-letter topic.
    pub fn dlq(topic: &str) -> String {
        format!("{}-dlq", topic)
    }

    /// Namespace component of a topic (`events/conversations` -> `events`).
    pub fn namespace(topic: &str) -> Option<&str> {
        topic.split_once('/').map(|(ns, _)| ns)
    }
}

/// Validate an ephemeral subject against the allowed prefix set.
pub fn validate_subject(subject: &str) -> Result<(), CoreError> {
    if VALID_SUBJECT_PREFIXES
        .iter()
        .any(|prefix| subject.starts_with(prefix))
    {
        Ok(())
    } else {
        Err(CoreError::InvalidSubject(subject.to_string()))
    }
}

/// Validate a durable topic: `namespace/name` with a known namespace.
pub fn validate_topic(topic: &str) -> Result<(), CoreError> {
    match topics::namespace(topic) {
        Some(topics::NAMESPACE_EVENTS)
        | Some(topics::NAMESPACE_ANALYTICS)
        | Some(topics::NAMESPACE_AUDIT) => {
            let name = topic.split_once('/').map(|(_, n)| n).unwrap_or("");
            if name.is_empty() {
                Err(CoreError::InvalidTopic(topic.to_string()))
            } else {
                Ok(())
            }
        },
        _ => Err(CoreError::InvalidTopic(topic.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_subjects() {
        assert!(validate_subject(subjects::SESSION_STARTED).is_ok());
        assert!(validate_subject(subjects::BRAIN_REQUEST).is_ok());
        assert!(validate_subject(subjects::HEARTBEAT).is_ok());
        assert!(validate_subject("agent.tts.synthesize").is_ok());
        assert!(validate_subject("system.service.registered").is_ok());
    }

    #[test]
    fn test_invalid_subject_rejected() {
        let err = validate_subject("foo.bar.baz").unwrap_err();
        assert!(matches!(err, CoreError::InvalidSubject(_)));
        assert_eq!(err.kind(), "invalid_subject");
    }

    #[test]
    fn test_prefix_must_match_full_segment() {
        // "agent.voices.x" does not start with "agent.voice." as a prefix
        assert!(validate_subject("agent.voices.x").is_err());
    }

    #[test]
    fn test_topics() {
        assert!(validate_topic(topics::CONVERSATIONS).is_ok());
        assert!(validate_topic(topics::AUDIT_LOGS).is_ok());
        assert!(validate_topic(&topics::analytics("latency-metrics")).is_ok());
        assert!(validate_topic("events/").is_err());
        assert!(validate_topic("mystery/conversations").is_err());
        assert!(validate_topic("conversations").is_err());
    }

    #[test]
    fn test_dlq_name() {
        assert_eq!(topics::dlq(topics::CONVERSATIONS), "events/conversations-dlq");
    }
}
