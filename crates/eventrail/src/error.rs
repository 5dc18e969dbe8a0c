use eventrail_broker::{BrokerError, EntryId};
use thiserror::Error;

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: BrokerError,
{
    /// The broker rejected or failed the operation.
    #[error("broker error: {0}")]
    Broker(#[source] E),

    /// The event could not be serialized.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised while turning a raw broker entry into a typed entry.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A required field is absent.
    #[error("entry {id} is missing field `{field}`")]
    MissingField {
        /// The entry id.
        id: EntryId,
        /// The missing field.
        field: &'static str,
    },

    /// A field is present but holds an unusable value.
    #[error("entry {id} has invalid `{field}`: {value:?}")]
    InvalidField {
        /// The entry id.
        id: EntryId,
        /// The offending field.
        field: &'static str,
        /// The raw value.
        value: String,
    },
}
