use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{AggregateId, Sequence};

/// Aggregate state folded up to and including the event at `sequence`.
///
/// Loading applies the stream tail starting at [`Snapshot::resume_from`] on
/// top of `state`; the result must equal a replay from sequence 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    /// Last event folded into `state`.
    pub sequence: Sequence,
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence: Sequence,
        state: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence,
            state,
            taken_at: Utc::now(),
        }
    }

    /// Serializes `state` into a snapshot at `sequence`.
    pub fn capture<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence: Sequence,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        let state = serde_json::to_value(state)?;
        Ok(Self::new(aggregate_id, aggregate_type, sequence, state))
    }

    /// Decodes the captured state.
    pub fn restore<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }

    /// First sequence not covered by this snapshot.
    pub fn resume_from(&self) -> Sequence {
        self.sequence.next()
    }
}
