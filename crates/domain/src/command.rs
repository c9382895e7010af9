//! The command message routed through the command bus.

use std::collections::HashMap;
use std::fmt;

use common::AggregateId;
use event_store::Sequence;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key carrying the id shared by every message of one interaction.
pub const CORRELATION_ID: &str = "correlation_id";

/// Metadata key naming the message that caused an event.
pub const CAUSATION_ID: &str = "causation_id";

/// Metadata key recording which command produced an event.
pub const COMMAND_TYPE: &str = "command_type";

/// A request to change the state of one aggregate.
///
/// Commands are values: interceptors never mutate a command in place, they
/// return a modified copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Routing key selecting the handler (e.g., "OpenAccount").
    pub command_type: String,

    /// The type of the target aggregate.
    pub aggregate_type: String,

    /// The target aggregate.
    pub aggregate_id: AggregateId,

    /// Named fields, in insertion order.
    pub payload: Map<String, Value>,

    /// Causation, correlation and other string metadata.
    pub metadata: HashMap<String, String>,

    /// Last sequence the caller believes the aggregate has.
    ///
    /// When set, dispatch fails with a concurrency conflict if the aggregate
    /// has moved on.
    pub expected_sequence: Option<Sequence>,
}

impl Command {
    /// Creates a command with an empty payload.
    pub fn new(
        command_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<AggregateId>,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload: Map::new(),
            metadata: HashMap::new(),
            expected_sequence: None,
        }
    }

    /// Adds or replaces a payload field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// Replaces the payload with the fields of a serializable value.
    ///
    /// Fails unless `payload` serializes to a JSON object.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = match serde_json::to_value(payload)? {
            Value::Object(fields) => fields,
            other => {
                return Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                    "command payload must be an object, got {other}"
                )));
            }
        };
        Ok(self)
    }

    /// Adds or replaces a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Requires the aggregate's last sequence to be `sequence` at dispatch.
    pub fn expecting(mut self, sequence: Sequence) -> Self {
        self.expected_sequence = Some(sequence);
        self
    }

    /// Returns a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Returns a metadata entry.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Deserializes the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}/{}",
            self.command_type, self.aggregate_type, self.aggregate_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Deposit {
        amount: i64,
    }

    #[test]
    fn builder_sets_fields_and_metadata() {
        let command = Command::new("Deposit", "Account", "A1")
            .with_field("amount", 50)
            .with_metadata(CORRELATION_ID, "c-1")
            .expecting(Sequence::new(0));

        assert_eq!(command.aggregate_id, AggregateId::new("A1"));
        assert_eq!(command.field("amount"), Some(&Value::from(50)));
        assert_eq!(command.metadata_value(CORRELATION_ID), Some("c-1"));
        assert_eq!(command.expected_sequence, Some(Sequence::new(0)));
        assert_eq!(command.to_string(), "Deposit -> Account/A1");
    }

    #[test]
    fn payload_keeps_insertion_order() {
        let command = Command::new("OpenAccount", "Account", "A1")
            .with_field("owner", "bob")
            .with_field("currency", "EUR")
            .with_field("branch", "north");

        let names: Vec<&str> = command.payload.keys().map(String::as_str).collect();
        assert_eq!(names, ["owner", "currency", "branch"]);
    }

    #[test]
    fn typed_payload_roundtrip() {
        let command = Command::new("Deposit", "Account", "A1")
            .with_payload(&Deposit { amount: 50 })
            .unwrap();
        assert_eq!(command.payload_as::<Deposit>().unwrap(), Deposit { amount: 50 });
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let result = Command::new("Deposit", "Account", "A1").with_payload(&42);
        assert!(result.is_err());
    }
}
