use eventrail_broker::{BrokerError, ParseEntryIdError};
use thiserror::Error;

/// Errors returned by the in-memory broker.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The group already exists on the stream.
    #[error("BUSYGROUP consumer group {group} already exists on {stream}")]
    GroupExists {
        /// Stream key.
        stream: String,
        /// Group name.
        group: String,
    },

    /// An id argument could not be parsed.
    #[error(transparent)]
    InvalidId(#[from] ParseEntryIdError),

    /// The group (or its stream) does not exist.
    #[error("NOGROUP no such consumer group {group} for stream {stream}")]
    NoGroup {
        /// Stream key.
        stream: String,
        /// Group name.
        group: String,
    },

    /// The stream does not exist.
    #[error("no such stream: {0}")]
    NoSuchStream(String),

    /// The broker was switched to unavailable.
    #[error("broker unavailable")]
    Unavailable,
}

impl BrokerError for Error {
    fn is_group_exists(&self) -> bool {
        matches!(self, Self::GroupExists { .. })
    }
}
