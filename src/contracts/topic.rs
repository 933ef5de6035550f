//! Topic naming rules (spec §3: "A dot-delimited string of the shape
//! `<domain>.<entity>[.<qualifier>]`").

use std::fmt;
use std::str::FromStr;

use crate::error::BusError;

/// Reserved top-level domains. Wildcards are not supported; every
/// subscription names an exact topic.
pub const RESERVED_DOMAINS: &[&str] = &[
    "camera",
    "process",
    "event",
    "notify",
    "storage",
    "analytics",
    "dashboard",
    "status",
    "config",
];

/// A validated, dot-delimited routing key.
///
/// `Topic` is a newtype rather than a bare `String` so that every place in
/// the bus that takes a topic gets compile-time assurance it has already
/// passed validation, the same way the teacher's `ActorEntity::Id` pushes
/// validation to the type boundary rather than re-checking at each call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading `<domain>` segment.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    fn validate(raw: &str) -> Result<(), BusError> {
        if raw.is_empty() {
            return Err(BusError::InvalidTopic("topic is empty".into()));
        }
        if raw.contains(['*', '+', '#']) {
            return Err(BusError::InvalidTopic(format!(
                "topic {raw:?} contains a wildcard character; wildcards are not supported"
            )));
        }
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() < 2 || segments.len() > 3 {
            return Err(BusError::InvalidTopic(format!(
                "topic {raw:?} must have 2 or 3 dot-delimited segments"
            )));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(BusError::InvalidTopic(format!(
                "topic {raw:?} has an empty segment"
            )));
        }
        if !RESERVED_DOMAINS.contains(&segments[0]) {
            return Err(BusError::InvalidTopic(format!(
                "topic {raw:?} uses unreserved domain {:?}",
                segments[0]
            )));
        }
        Ok(())
    }

    /// Build a topic without domain validation, for internal composition
    /// (e.g. `camera.<id>.frame`) where the id is not known at compile time.
    pub fn new_unchecked(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl FromStr for Topic {
    type Err = BusError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::validate(raw)?;
        Ok(Self(raw.to_string()))
    }
}

impl TryFrom<&str> for Topic {
    type Error = BusError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl TryFrom<String> for Topic {
    type Error = BusError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::validate(&raw)?;
        Ok(Self(raw))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_two_and_three_segment_topics() {
        assert!(Topic::from_str("status.bus").is_ok());
        assert!(Topic::from_str("process.motion.detected").is_ok());
    }

    #[test]
    fn rejects_unreserved_domain() {
        assert!(Topic::from_str("widgets.created").is_err());
    }

    #[test]
    fn rejects_wildcards() {
        assert!(Topic::from_str("status.*").is_err());
    }

    #[test]
    fn rejects_too_many_segments() {
        assert!(Topic::from_str("status.bus.extra.segment").is_err());
    }
}
