use chrono::{DateTime, Utc};
use eventrail_broker::{EntryId, Fields, RawEntry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Field names of an origin stream entry.
pub mod fields {
    /// Event discriminant.
    pub const TYPE: &str = "type";
    /// Producing service.
    pub const SERVICE: &str = "service";
    /// JSON-encoded event.
    pub const PAYLOAD: &str = "payload";
    /// Producer wall-clock timestamp.
    pub const CREATED_AT: &str = "createdAt";

    /// Id of the origin entry a dead letter was moved from.
    pub const ORIGINAL_ID: &str = "original_id";
    /// Consumer that moved a dead letter.
    pub const CONSUMER: &str = "consumer";
    /// Delivery count measured when a dead letter was moved.
    pub const RETRIES: &str = "retries";
    /// Wall-clock time a dead letter was moved.
    pub const MOVED_AT: &str = "moved_at";
}

/// A typed, timestamped unit of domain data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Event<P = serde_json::Value> {
    #[serde(rename = "type")]
    event_type: String,

    payload: P,

    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

impl<P> Event<P> {
    /// Creates an event stamped with the current time.
    pub fn new<T>(event_type: T, payload: P) -> Self
    where
        T: Into<String>,
    {
        Self {
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Replaces the creation timestamp.
    #[must_use]
    pub fn with_created_at(self, created_at: DateTime<Utc>) -> Self {
        Self { created_at, ..self }
    }

    /// The event discriminant.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The event payload.
    pub const fn payload(&self) -> &P {
        &self.payload
    }

    /// When the event was created.
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

fn required(raw: &mut RawEntry, field: &'static str) -> Result<String, ParseError> {
    raw.fields.remove(field).ok_or_else(|| ParseError::MissingField {
        id: raw.id.clone(),
        field,
    })
}

/// An entry read from an origin stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    /// Broker-assigned id; the unit of acknowledgment.
    pub id: EntryId,

    /// Event discriminant.
    pub event_type: String,

    /// Service that published the entry.
    pub service: String,

    /// JSON-encoded event.
    pub payload: String,

    /// Producer wall-clock timestamp, if the producer stamped one.
    pub created_at: Option<String>,
}

impl StreamEntry {
    /// Decodes the payload back into the published event.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON event of the requested shape.
    pub fn event<P>(&self) -> Result<Event<P>, serde_json::Error>
    where
        P: DeserializeOwned,
    {
        serde_json::from_str(&self.payload)
    }
}

impl TryFrom<RawEntry> for StreamEntry {
    type Error = ParseError;

    fn try_from(mut raw: RawEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            event_type: required(&mut raw, fields::TYPE)?,
            service: required(&mut raw, fields::SERVICE)?,
            payload: required(&mut raw, fields::PAYLOAD)?,
            created_at: raw.fields.remove(fields::CREATED_AT),
            id: raw.id,
        })
    }
}

/// An entry of the dead-letter stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// Id of this entry in the dead-letter stream.
    pub id: EntryId,

    /// Id of the entry in its origin stream.
    pub original_id: EntryId,

    /// Event discriminant.
    pub event_type: String,

    /// Consumer that gave up on the entry.
    pub consumer: String,

    /// Service that published the entry.
    pub service: String,

    /// JSON-encoded event.
    pub payload: String,

    /// Delivery count when the entry was moved.
    pub retries: u64,

    /// Wall-clock time of the move.
    pub moved_at: String,
}

impl DeadLetterEntry {
    /// Builds a dead letter from an origin entry. The id is assigned on append.
    #[must_use]
    pub fn from_origin(
        entry: &StreamEntry,
        consumer: &str,
        retries: u64,
        moved_at: String,
    ) -> Self {
        Self {
            id: EntryId::from(String::new()),
            original_id: entry.id.clone(),
            event_type: entry.event_type.clone(),
            consumer: consumer.to_string(),
            service: entry.service.clone(),
            payload: entry.payload.clone(),
            retries,
            moved_at,
        }
    }

    /// Decodes the payload back into the published event.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON event of the requested shape.
    pub fn event<P>(&self) -> Result<Event<P>, serde_json::Error>
    where
        P: DeserializeOwned,
    {
        serde_json::from_str(&self.payload)
    }

    /// The fields written to the dead-letter stream.
    #[must_use]
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            (fields::ORIGINAL_ID.to_string(), self.original_id.to_string()),
            (fields::TYPE.to_string(), self.event_type.clone()),
            (fields::CONSUMER.to_string(), self.consumer.clone()),
            (fields::SERVICE.to_string(), self.service.clone()),
            (fields::PAYLOAD.to_string(), self.payload.clone()),
            (fields::RETRIES.to_string(), self.retries.to_string()),
            (fields::MOVED_AT.to_string(), self.moved_at.clone()),
        ])
    }
}

impl TryFrom<RawEntry> for DeadLetterEntry {
    type Error = ParseError;

    fn try_from(mut raw: RawEntry) -> Result<Self, Self::Error> {
        let retries = required(&mut raw, fields::RETRIES)?;
        let retries = retries.parse().map_err(|_| ParseError::InvalidField {
            id: raw.id.clone(),
            field: fields::RETRIES,
            value: retries,
        })?;

        Ok(Self {
            original_id: required(&mut raw, fields::ORIGINAL_ID)?.into(),
            event_type: required(&mut raw, fields::TYPE)?,
            consumer: required(&mut raw, fields::CONSUMER)?,
            service: required(&mut raw, fields::SERVICE)?,
            payload: required(&mut raw, fields::PAYLOAD)?,
            retries,
            moved_at: required(&mut raw, fields::MOVED_AT)?,
            id: raw.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use serde_json::json;

    fn raw(pairs: &[(&str, &str)]) -> RawEntry {
        RawEntry {
            id: EntryId::from("5-0"),
            fields: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::new("order.created", json!({ "id": 42 }));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "order.created");
        assert_eq!(value["payload"]["id"], 42);
        assert!(value["createdAt"].is_string());
    }

    #[test]
    fn test_stream_entry_requires_type() {
        let result = StreamEntry::try_from(raw(&[("service", "orders"), ("payload", "{}")]));

        assert_matches!(
            result,
            Err(ParseError::MissingField { field: "type", .. })
        );
    }

    #[test]
    fn test_stream_entry_created_at_is_optional() {
        let entry = StreamEntry::try_from(raw(&[
            ("type", "t"),
            ("service", "orders"),
            ("payload", "{}"),
        ]))
        .unwrap();

        assert_eq!(entry.id.as_str(), "5-0");
        assert_eq!(entry.created_at, None);
    }

    #[test]
    fn test_dead_letter_fields() {
        let origin = StreamEntry {
            id: EntryId::from("1-1"),
            event_type: "order.created".to_string(),
            service: "orders".to_string(),
            payload: "{}".to_string(),
            created_at: None,
        };

        let letter =
            DeadLetterEntry::from_origin(&origin, "orders-worker-1", 3, "2024-01-01 00:00:00".to_string());
        let fields = letter.to_fields();

        assert_eq!(fields["original_id"], "1-1");
        assert_eq!(fields["retries"], "3");
        assert_eq!(fields["consumer"], "orders-worker-1");

        let parsed = DeadLetterEntry::try_from(RawEntry {
            id: EntryId::from("9-0"),
            fields,
        })
        .unwrap();
        assert_eq!(parsed.original_id, origin.id);
        assert_eq!(parsed.retries, 3);
        assert_eq!(parsed.id.as_str(), "9-0");
    }

    #[test]
    fn test_dead_letter_rejects_non_numeric_retries() {
        let result = DeadLetterEntry::try_from(raw(&[
            ("original_id", "1-0"),
            ("type", "t"),
            ("consumer", "c"),
            ("service", "s"),
            ("payload", "{}"),
            ("retries", "many"),
            ("moved_at", "2024-01-01 00:00:00"),
        ]));

        assert_matches!(
            result,
            Err(ParseError::InvalidField { field: "retries", .. })
        );
    }
}
