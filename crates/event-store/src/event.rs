use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, EventStoreError, Result};

/// Globally unique event id, assigned when the envelope is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Position of an event within its aggregate's stream.
///
/// Streams are dense and 0-based: the first event is 0 and every append
/// continues at `last + 1`. "No events yet" is `Option::<Sequence>::None`,
/// never a sentinel value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn first() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Value bound to `BIGINT` columns.
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    /// Sequence the next event must carry when the stream currently ends at
    /// `last`.
    pub fn after(last: Option<Sequence>) -> Self {
        last.map_or(Self::first(), |s| s.next())
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Renders a stream's last position for error messages.
pub(crate) fn position(last: &Option<Sequence>) -> String {
    last.map_or_else(|| "<empty stream>".to_string(), |seq| seq.to_string())
}

/// A persisted event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence: Sequence,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// Correlation, causation and command metadata copied from the command.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EventEnvelope {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Decodes the payload as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// Assembles an [`EventEnvelope`]; the id and timestamp are filled in by
/// [`build`](Self::build).
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    sequence: Option<Sequence>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, String>,
}

impl EventEnvelopeBuilder {
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Serializes a domain event as the payload.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Fails with `InvalidBatch` naming the first missing field.
    pub fn build(self) -> Result<EventEnvelope> {
        fn require<T>(value: Option<T>, field: &str) -> Result<T> {
            value.ok_or_else(|| {
                EventStoreError::InvalidBatch(format!("event envelope is missing `{field}`"))
            })
        }

        Ok(EventEnvelope {
            event_id: EventId::new(),
            event_type: require(self.event_type, "event_type")?,
            aggregate_id: require(self.aggregate_id, "aggregate_id")?,
            aggregate_type: require(self.aggregate_type, "aggregate_type")?,
            sequence: require(self.sequence, "sequence")?,
            timestamp: Utc::now(),
            payload: require(self.payload, "payload")?,
            metadata: self.metadata,
        })
    }
}
