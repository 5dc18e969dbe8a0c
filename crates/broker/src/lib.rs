//! Abstract interface for log-structured brokers with consumer groups.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod id;

pub use id::{EntryId, ParseEntryIdError};

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for broker errors.
pub trait BrokerError: Debug + Error + Send + Sync + 'static {
    /// Whether the broker refused a group creation because the group exists.
    fn is_group_exists(&self) -> bool {
        false
    }
}

/// The field map stored in a single stream entry.
pub type Fields = BTreeMap<String, String>;

/// A raw entry as returned by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEntry {
    /// Broker-assigned id.
    pub id: EntryId,

    /// Entry fields.
    pub fields: Fields,
}

/// Where a newly created consumer group starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver the whole stream history (`0`).
    Beginning,

    /// Deliver only entries appended after creation (`$`).
    Latest,
}

impl GroupStart {
    /// The broker-level start id.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Beginning => "0",
            Self::Latest => "$",
        }
    }
}

/// Offset for a group-relative read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOffset {
    /// Entries never delivered to any consumer of the group (`>`).
    New,

    /// This consumer's own pending entries with ids greater than the given id
    /// (`0` replays the whole history).
    History(EntryId),
}

impl ReadOffset {
    /// The broker-level offset argument.
    #[must_use]
    pub fn as_arg(&self) -> String {
        match self {
            Self::New => ">".to_string(),
            Self::History(id) => id.to_string(),
        }
    }
}

/// Summary of a consumer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group name.
    pub name: String,

    /// Number of consumers known to the group.
    pub consumers: u64,

    /// Number of pending entries.
    pub pending: u64,

    /// Last id delivered to the group.
    pub last_delivered_id: EntryId,
}

/// A pending entry as tracked by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    /// Entry id.
    pub id: EntryId,

    /// Consumer currently owning the entry.
    pub consumer: String,

    /// Time since the entry was last delivered.
    pub idle: Duration,

    /// Number of times the entry has been delivered.
    pub times_delivered: u64,
}

/// Result of an auto-claim call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutoClaim {
    /// Cursor to continue claiming from; `0-0` once the pending list is exhausted.
    pub next_cursor: EntryId,

    /// Entries whose ownership moved to the calling consumer.
    pub entries: Vec<RawEntry>,

    /// Pending ids whose entries no longer exist in the stream.
    pub deleted: Vec<EntryId>,
}

/// A trait representing a broker client with consumer-group semantics.
///
/// Every operation is a single round trip. The only suspending operation is
/// [`StreamBroker::read_group`] when given a block duration.
#[async_trait]
pub trait StreamBroker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// Appends an entry to the stream and returns its id.
    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, Self::Error>;

    /// Creates a consumer group. Fails if the group already exists.
    ///
    /// # Arguments
    /// * `mkstream`: create the stream if it does not exist yet.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), Self::Error>;

    /// Lists the groups of a stream. Fails if the stream does not exist.
    async fn list_groups(&self, stream: &str) -> Result<Vec<GroupInfo>, Self::Error>;

    /// Reads entries on behalf of a consumer of a group.
    ///
    /// With [`ReadOffset::New`] and a `block` duration, waits up to `block`
    /// for new entries. An empty vector means nothing was available.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<RawEntry>, Self::Error>;

    /// Acknowledges entries, returning how many were actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, Self::Error>;

    /// Claims entries idle for at least `min_idle`, scanning from `start`.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &EntryId,
        count: usize,
    ) -> Result<AutoClaim, Self::Error>;

    /// Lists pending entries with ids in `start..=end`.
    async fn pending_info(
        &self,
        stream: &str,
        group: &str,
        start: &EntryId,
        end: &EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Self::Error>;
}
