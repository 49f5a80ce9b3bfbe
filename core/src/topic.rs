//! Topic-exchange binding patterns.
//!
//! Routing keys are dot-separated words such as `booking.completed` or
//! `user.deleted`. A queue is bound to the exchange with one or more patterns:
//!
//! - `*` matches exactly one word (`booking.*` matches `booking.completed`)
//! - `#` matches zero or more words (`user.#` matches `user` and `user.profile.updated`)
//!
//! Patterns are parsed once, when a subscription is registered, so a typo in a
//! binding fails at startup instead of silently never matching.

use crate::error::EventBusError;
use std::fmt;
use std::str::FromStr;

/// Longest routing key an AMQP short string can carry.
pub const MAX_ROUTING_KEY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Word(String),
    /// `*`
    One,
    /// `#`
    Any,
}

/// A validated binding pattern.
///
/// # Example
///
/// ```
/// use hometrip_events_core::topic::TopicPattern;
///
/// let pattern = TopicPattern::parse("booking.*").unwrap();
/// assert!(pattern.matches("booking.completed"));
/// assert!(!pattern.matches("booking.completed.late"));
/// assert!(!pattern.matches("user.deleted"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse and validate a binding pattern.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidPattern`] if the pattern is empty,
    /// contains an empty word, exceeds the routing key length limit, or mixes
    /// a wildcard with other characters inside one word (e.g. `book*`).
    pub fn parse(pattern: &str) -> Result<Self, EventBusError> {
        let invalid = |reason: &str| EventBusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if pattern.len() > MAX_ROUTING_KEY_LEN {
            return Err(invalid("pattern is longer than 255 bytes"));
        }

        let segments = pattern
            .split('.')
            .map(|word| match word {
                "" => Err(invalid("pattern contains an empty word")),
                "*" => Ok(Segment::One),
                "#" => Ok(Segment::Any),
                w if w.contains(['*', '#']) => {
                    Err(invalid("wildcards must occupy a whole word"))
                },
                w => Ok(Segment::Word(w.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains any wildcard.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Word(_)))
    }

    /// Check a routing key against this pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        match_segments(&self.segments, &words)
    }
}

// Backtracking only happens at `#`, and real bindings carry one or two of them.
fn match_segments(segments: &[Segment], words: &[&str]) -> bool {
    match segments.split_first() {
        None => words.is_empty(),
        Some((Segment::Any, rest)) => {
            (0..=words.len()).any(|skip| match_segments(rest, &words[skip..]))
        },
        Some((Segment::One, rest)) => !words.is_empty() && match_segments(rest, &words[1..]),
        Some((Segment::Word(expected), rest)) => match words.split_first() {
            Some((word, remaining)) => word == expected && match_segments(rest, remaining),
            None => false,
        },
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for TopicPattern {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validate a routing key used for publishing.
///
/// # Errors
///
/// Returns [`EventBusError::InvalidRoutingKey`] if the key contains a wildcard
/// or does not fit in an AMQP short string.
pub fn validate_routing_key(routing_key: &str) -> Result<(), EventBusError> {
    let invalid = |reason: &str| EventBusError::InvalidRoutingKey {
        routing_key: routing_key.to_string(),
        reason: reason.to_string(),
    };

    if routing_key.len() > MAX_ROUTING_KEY_LEN {
        return Err(invalid("routing key is longer than 255 bytes"));
    }
    if routing_key.contains(['*', '#']) {
        return Err(invalid("wildcards are only valid in binding patterns"));
    }
    Ok(())
}
