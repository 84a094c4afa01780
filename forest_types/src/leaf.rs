//! The universal event envelope carried on the wind.

use crate::{subject::validate_subject, ValidationError};
use forest_time::Time;
use serde_json::Value;

/// One event on the ephemeral bus.
///
/// All four fields are required; [`Leaf::validate`] fails closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    /// Hierarchical dotted event name, e.g. `payment.completed`.
    pub subject: String,
    /// Structured payload.
    pub data: Value,
    /// Identifier of the producing component.
    pub source: String,
    /// Wall-clock time of production.
    pub timestamp: Time,
}

impl Leaf {
    /// Build a leaf. The result still needs [`Leaf::validate`] before it may
    /// be published.
    pub fn new(
        subject: impl Into<String>,
        data: Value,
        source: impl Into<String>,
        timestamp: Time,
    ) -> Self {
        Self {
            subject: subject.into(),
            data,
            source: source.into(),
            timestamp,
        }
    }

    /// Checks every envelope invariant, failing closed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_subject(&self.subject)?;
        if self.source.is_empty() {
            return Err(ValidationError::EmptyField { field: "source" });
        }
        if self.data.is_null() {
            return Err(ValidationError::MissingData);
        }
        if self.timestamp.timestamp_nanos() == 0 {
            return Err(ValidationError::ZeroTimestamp);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn ts() -> Time {
        Time::from_timestamp_millis(1_600_000_000_000)
    }

    #[test]
    fn valid_leaf() {
        let leaf = Leaf::new("payment.completed", json!({"amount": 42}), "stripe", ts());
        assert!(leaf.validate().is_ok());
    }

    #[test]
    fn rejects_missing_fields() {
        let leaf = Leaf::new("", json!({}), "stripe", ts());
        assert_matches!(leaf.validate(), Err(ValidationError::EmptySubject));

        let leaf = Leaf::new("payment.completed", json!({}), "", ts());
        assert_matches!(
            leaf.validate(),
            Err(ValidationError::EmptyField { field: "source" })
        );

        let leaf = Leaf::new("payment.completed", Value::Null, "stripe", ts());
        assert_matches!(leaf.validate(), Err(ValidationError::MissingData));

        let leaf = Leaf::new(
            "payment.completed",
            json!({}),
            "stripe",
            Time::from_timestamp_nanos(0),
        );
        assert_matches!(leaf.validate(), Err(ValidationError::ZeroTimestamp));
    }

    #[test]
    fn rejects_wildcard_subject() {
        let leaf = Leaf::new("payment.*", json!({}), "stripe", ts());
        assert_matches!(
            leaf.validate(),
            Err(ValidationError::WildcardInPublish { .. })
        );
    }
}
