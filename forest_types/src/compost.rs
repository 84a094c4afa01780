//! State-change records appended to the change log.

use crate::{Slot, ValidationError};
use forest_time::Time;
use serde_json::Value;
use std::str::FromStr;

/// What a change record does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Insert a new entity; fails if it already exists.
    Create,
    /// Replace the current value of an existing entity.
    Update,
    /// Remove the entity.
    Delete,
}

impl Action {
    /// Canonical lowercase rendering used on the wire and in subjects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(ValidationError::InvalidAction {
                action: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the change log.
///
/// The `slot` is assigned by the log on append; producers never choose it.
#[derive(Debug, Clone, PartialEq)]
pub struct Compost {
    /// Key naming the target entity in the state store.
    pub entity: String,
    /// What happens to the entity.
    pub action: Action,
    /// Payload; `None` only for deletes.
    pub data: Option<Value>,
    /// Name of the emitting nim.
    pub producer: String,
    /// Time of production.
    pub timestamp: Time,
    /// Sequence number assigned on append.
    pub slot: Slot,
}

impl Compost {
    /// Build an unsequenced record; the log replaces `slot` on append.
    pub fn new(
        entity: impl Into<String>,
        action: Action,
        data: Option<Value>,
        producer: impl Into<String>,
        timestamp: Time,
    ) -> Self {
        // Deletes never carry a payload.
        let data = match action {
            Action::Delete => None,
            _ => data,
        };
        Self {
            entity: entity.into(),
            action,
            data,
            producer: producer.into(),
            timestamp,
            slot: Slot::new(0),
        }
    }

    /// Checks the change-record invariants, failing closed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.entity.is_empty() {
            return Err(ValidationError::EmptyField { field: "entity" });
        }
        if self.producer.is_empty() {
            return Err(ValidationError::EmptyField { field: "producer" });
        }
        match (&self.action, &self.data) {
            (Action::Delete, _) => {}
            (_, None) => return Err(ValidationError::MissingData),
            (_, Some(Value::Null)) => return Err(ValidationError::MissingData),
            _ => {}
        }
        Ok(())
    }

    /// Bus subject this record is published under.
    pub fn subject(&self) -> String {
        format!("{}{}.{}", crate::HUMUS_PREFIX, self.producer, self.action)
    }
}
