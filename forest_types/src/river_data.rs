//! Raw ingress records flowing down the river.

use crate::{subject::validate_subject, ValidationError, RIVER_PREFIX};
use forest_time::Time;

/// One raw, possibly non-JSON record from an external source.
#[derive(Debug, Clone, PartialEq)]
pub struct RiverData {
    /// Ingress subject; always carries the `river.` prefix.
    pub subject: String,
    /// Opaque payload bytes.
    pub data: Vec<u8>,
    /// Time of ingestion.
    pub timestamp: Time,
}

impl RiverData {
    /// Build an ingress record, prepending the `river.` prefix when absent.
    pub fn new(subject: impl Into<String>, data: Vec<u8>, timestamp: Time) -> Self {
        let subject = subject.into();
        let subject = if subject.starts_with(RIVER_PREFIX) {
            subject
        } else {
            format!("{RIVER_PREFIX}{subject}")
        };
        Self {
            subject,
            data,
            timestamp,
        }
    }

    /// Checks the ingress invariants: a valid `river.`-prefixed subject and a
    /// non-empty payload.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_subject(&self.subject)?;
        if !self.subject.starts_with(RIVER_PREFIX) {
            return Err(ValidationError::MissingRiverPrefix {
                subject: self.subject.clone(),
            });
        }
        if self.data.is_empty() {
            return Err(ValidationError::MissingData);
        }
        Ok(())
    }
}
