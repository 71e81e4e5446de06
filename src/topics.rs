//! Topic name and filter rules shared by the hub and the transport.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic '{0}' must not contain wildcards")]
    WildcardInName(String),
    #[error("topic filter '{0}' has a misplaced wildcard")]
    MisplacedWildcard(String),
}

/// Checks a topic used for publishing: non-empty and wildcard free.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if !rumqttc::valid_topic(topic) {
        return Err(TopicError::WildcardInName(topic.to_string()));
    }
    Ok(())
}

/// Checks a subscription filter. `+` must fill a whole level and `#` must be the last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }

    // rumqttc only looks for '#' in the last level.
    let partial_plus = filter
        .split('/')
        .any(|level| level != "+" && level.contains('+'));
    if partial_plus || !rumqttc::valid_filter(filter) {
        return Err(TopicError::MisplacedWildcard(filter.to_string()));
    }
    Ok(())
}

/// MQTT wildcard matching of a concrete topic against a filter.
/// Topics starting with '$' never match.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    rumqttc::matches(topic, filter)
}
