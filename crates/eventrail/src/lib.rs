//! At-least-once event-stream consumption over broker consumer groups.
//!
//! A [`StreamChannel`] publishes to and reads from one stream under one
//! consumer group. A [`ConsumptionDriver`] runs a handler over a channel,
//! reclaiming entries abandoned by crashed or failing consumers before reading
//! new ones, and moves entries that keep failing to a dead-letter stream. A
//! [`DeadLetterChannel`] consumes that stream, either reprocessing a service's
//! own letters or notifying about every letter moved from now on.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod channel;
mod clock;
mod config;
mod dead_letter;
mod driver;
mod error;
mod event;
mod handler;

pub use channel::{Claimed, StreamChannel};
pub use clock::{TIMESTAMP_FORMAT, WallClock};
pub use config::{ChannelProfile, ChannelSettings, ConfigError, EventStreamConfig, MIN_BLOCK_TIME};
pub use dead_letter::{DeadLetterChannel, Notifier, PassReport, ReprocessFilter, Reprocessor};
pub use driver::{ConsumptionDriver, CycleReport};
pub use error::{Error, ParseError};
pub use event::{DeadLetterEntry, Event, StreamEntry, fields};
pub use handler::{DeadLetterHandler, EventHandler, HandlerError};

pub use eventrail_broker::{
    BrokerError, EntryId, Fields, GroupInfo, GroupStart, PendingEntry, RawEntry, StreamBroker,
};
