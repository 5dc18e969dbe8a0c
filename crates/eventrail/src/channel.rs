use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eventrail_broker::{
    BrokerError, EntryId, Fields, GroupStart, PendingEntry, RawEntry, ReadOffset, StreamBroker,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::WallClock;
use crate::config::{ChannelProfile, EventStreamConfig, MIN_BLOCK_TIME};
use crate::error::{Error, ParseError};
use crate::event::{DeadLetterEntry, Event, StreamEntry, fields};

/// Entries transferred to this consumer by a reclaim pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Claimed {
    /// Claimed entries, in pending-list order.
    pub entries: Vec<StreamEntry>,

    /// Where a further pass would continue; `0-0` when the pending list was exhausted.
    pub next_cursor: EntryId,
}

/// All interaction with one stream under one consumer group.
#[derive(Clone, Debug)]
pub struct StreamChannel<B, P>
where
    B: StreamBroker,
    P: ChannelProfile,
{
    broker: B,
    clock: WallClock,
    dead_letter_key: String,
    group_fresh: Arc<AtomicBool>,
    group_ready: Arc<AtomicBool>,
    group_start: GroupStart,
    profile: P,
    service: String,
    stream_key: String,
}

impl<B, P> StreamChannel<B, P>
where
    B: StreamBroker,
    P: ChannelProfile,
{
    /// Creates a channel over `stream_key` publishing as `service`.
    ///
    /// Dead letters go to `{stream_key}:dead-letter` unless
    /// [`with_dead_letter_key`](Self::with_dead_letter_key) is used. The group
    /// is created at the beginning of the stream unless
    /// [`with_group_start`](Self::with_group_start) says otherwise.
    pub fn new<K, S>(broker: B, stream_key: K, service: S, profile: P) -> Self
    where
        K: Into<String>,
        S: Into<String>,
    {
        let stream_key = stream_key.into();

        Self {
            broker,
            clock: WallClock::default(),
            dead_letter_key: format!("{stream_key}:dead-letter"),
            group_fresh: Arc::new(AtomicBool::new(false)),
            group_ready: Arc::new(AtomicBool::new(false)),
            group_start: GroupStart::Beginning,
            profile,
            service: service.into(),
            stream_key,
        }
    }

    /// Creates a channel over the configured origin stream.
    pub fn from_config(broker: B, config: &EventStreamConfig, profile: P) -> Self {
        Self::new(broker, config.stream_key(), config.service_name.clone(), profile)
            .with_dead_letter_key(config.dead_letter_stream_key())
            .with_clock(WallClock::new(config.timezone))
    }

    /// Sets the dead-letter stream key.
    #[must_use]
    pub fn with_dead_letter_key<K: Into<String>>(self, dead_letter_key: K) -> Self {
        Self {
            dead_letter_key: dead_letter_key.into(),
            ..self
        }
    }

    /// Sets the clock used for timestamps.
    #[must_use]
    pub fn with_clock(self, clock: WallClock) -> Self {
        Self { clock, ..self }
    }

    /// Sets where the group starts if this channel has to create it.
    #[must_use]
    pub fn with_group_start(self, group_start: GroupStart) -> Self {
        Self {
            group_start,
            ..self
        }
    }

    /// The stream this channel reads and writes.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// The dead-letter stream this channel forwards to.
    pub fn dead_letter_key(&self) -> &str {
        &self.dead_letter_key
    }

    /// The service this channel publishes as.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The channel's group, consumer and thresholds.
    pub const fn profile(&self) -> &P {
        &self.profile
    }

    /// Publishes an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or the append fails.
    /// Nothing is retried here.
    pub async fn publish<T>(&self, event: &Event<T>) -> Result<EntryId, Error<B::Error>>
    where
        T: Serialize + Sync,
    {
        let fields = Fields::from([
            (fields::TYPE.to_string(), event.event_type().to_string()),
            (fields::SERVICE.to_string(), self.service.clone()),
            (fields::PAYLOAD.to_string(), serde_json::to_string(event)?),
            (
                fields::CREATED_AT.to_string(),
                self.clock.render(event.created_at()),
            ),
        ]);

        let id = self
            .broker
            .append(&self.stream_key, fields)
            .await
            .map_err(Error::Broker)?;

        info!(stream = %self.stream_key, event_type = event.event_type(), %id, "published event");

        Ok(id)
    }

    /// Creates the group at the beginning of the stream if it does not exist.
    ///
    /// Returns whether this call created it.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails to create the group.
    pub async fn ensure_group_from_start(&self) -> Result<bool, Error<B::Error>> {
        self.ensure_group(GroupStart::Beginning).await
    }

    /// Creates the group at the tail of the stream if it does not exist, so only
    /// entries appended afterwards are delivered.
    ///
    /// Returns whether this call created it.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails to create the group.
    pub async fn ensure_group_from_now(&self) -> Result<bool, Error<B::Error>> {
        self.ensure_group(GroupStart::Latest).await
    }

    async fn ensure_group(&self, start: GroupStart) -> Result<bool, Error<B::Error>> {
        let group = self.profile.group_name();

        match self.broker.list_groups(&self.stream_key).await {
            Ok(groups) if groups.iter().any(|g| g.name == group) => {
                self.group_ready.store(true, Ordering::SeqCst);
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => {
                info!(stream = %self.stream_key, error = %e, "no groups yet or stream not found, creating group");
            }
        }

        match self
            .broker
            .create_group(&self.stream_key, group, start, true)
            .await
        {
            Ok(()) => {
                info!(stream = %self.stream_key, group, start = start.as_str(), "created consumer group");
                self.group_ready.store(true, Ordering::SeqCst);
                self.group_fresh.store(true, Ordering::SeqCst);
                Ok(true)
            }
            // Another worker created it between the listing and our create.
            Err(e) if e.is_group_exists() => {
                self.group_ready.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(e) => {
                error!(stream = %self.stream_key, group, error = %e, "failed to create consumer group");
                Err(Error::Broker(e))
            }
        }
    }

    /// Reads the next batch of entries for this consumer.
    ///
    /// The first read after this channel created the group uses offset `0`, the
    /// consumer's own history, and falls through to new entries (`>`) in the
    /// same call. A group that was just created has no pending entries, so that
    /// history read is empty and costs one extra round trip.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be ensured or the read fails.
    pub async fn get_unprocessed_events(&self) -> Result<Vec<StreamEntry>, Error<B::Error>> {
        self.read_entries().await
    }

    /// Like [`get_unprocessed_events`](Self::get_unprocessed_events), parsing
    /// entries into any entry type.
    ///
    /// Malformed entries are logged, acknowledged and dropped from the batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be ensured or the read fails.
    pub async fn read_entries<E>(&self) -> Result<Vec<E>, Error<B::Error>>
    where
        E: TryFrom<RawEntry, Error = ParseError>,
    {
        if !self.group_ready.load(Ordering::SeqCst) {
            self.ensure_group(self.group_start).await?;
        }
        let just_created = self.group_fresh.swap(false, Ordering::SeqCst);

        let count = self.profile.batch_size().max(1);
        let block = self.profile.block_time().max(MIN_BLOCK_TIME);

        let mut raw = Vec::new();
        if just_created {
            raw = self
                .read_raw(ReadOffset::History(EntryId::zero()), count, None)
                .await?;
        }
        if raw.is_empty() {
            raw = self.read_raw(ReadOffset::New, count, Some(block)).await?;
        }

        if raw.is_empty() {
            info!(
                stream = %self.stream_key,
                group = self.profile.group_name(),
                "no entries returned from group read"
            );
            return Ok(Vec::new());
        }

        let entries = self.parse_entries(raw).await;
        debug!(stream = %self.stream_key, count = entries.len(), "parsed entries");

        Ok(entries)
    }

    async fn read_raw(
        &self,
        offset: ReadOffset,
        count: usize,
        block: Option<std::time::Duration>,
    ) -> Result<Vec<RawEntry>, Error<B::Error>> {
        self.broker
            .read_group(
                &self.stream_key,
                self.profile.group_name(),
                self.profile.consumer_name(),
                offset,
                count,
                block,
            )
            .await
            .map_err(|e| {
                // The group may have been dropped; check again on the next read.
                self.group_ready.store(false, Ordering::SeqCst);
                Error::Broker(e)
            })
    }

    async fn parse_entries<E>(&self, raw: Vec<RawEntry>) -> Vec<E>
    where
        E: TryFrom<RawEntry, Error = ParseError>,
    {
        let mut entries = Vec::with_capacity(raw.len());

        for entry in raw {
            let id = entry.id.clone();
            match E::try_from(entry) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(stream = %self.stream_key, %id, error = %e, "skipping malformed entry");
                    self.acknowledge(&id).await;
                }
            }
        }

        entries
    }

    /// Removes an entry from the group's pending set.
    ///
    /// Failures are logged, not returned: the entry stays claimable and is
    /// retried by a later reclaim pass.
    pub async fn acknowledge(&self, id: &EntryId) {
        if id.is_empty() {
            warn!(stream = %self.stream_key, "acknowledge skipped: empty message id");
            return;
        }

        match self
            .broker
            .ack(&self.stream_key, self.profile.group_name(), std::slice::from_ref(id))
            .await
        {
            Ok(acked) => info!(stream = %self.stream_key, %id, acked, "acknowledged entry"),
            Err(e) => error!(stream = %self.stream_key, %id, error = %e, "acknowledge failed"),
        }
    }

    /// Claims entries that other consumers left pending longer than the idle
    /// threshold. Only one page of at most `max_claim_count` entries is claimed.
    ///
    /// Broker failures are logged and yield an empty claim.
    pub async fn claim_abandoned(&self) -> Claimed {
        if !self.group_ready.load(Ordering::SeqCst) {
            if let Err(e) = self.ensure_group(self.group_start).await {
                error!(stream = %self.stream_key, error = %e, "cannot claim without a group");
                return Claimed::default();
            }
        }

        let claim = match self
            .broker
            .auto_claim(
                &self.stream_key,
                self.profile.group_name(),
                self.profile.consumer_name(),
                self.profile.idle_time(),
                &EntryId::zero(),
                self.profile.max_claim_count().max(1),
            )
            .await
        {
            Ok(claim) => claim,
            Err(e) => {
                error!(stream = %self.stream_key, error = %e, "auto-claim failed");
                return Claimed::default();
            }
        };

        if !claim.deleted.is_empty() {
            warn!(
                stream = %self.stream_key,
                deleted = ?claim.deleted,
                "pending entries no longer exist in the stream"
            );
        }

        if !claim.entries.is_empty() {
            info!(
                stream = %self.stream_key,
                count = claim.entries.len(),
                next_cursor = %claim.next_cursor,
                "claimed abandoned entries"
            );
        }

        Claimed {
            entries: self.parse_entries(claim.entries).await,
            next_cursor: claim.next_cursor,
        }
    }

    /// Delivery count and idle time of one pending entry; `None` if it is not pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be queried.
    pub async fn pending_info(&self, id: &EntryId) -> Result<Option<PendingEntry>, Error<B::Error>> {
        let pending = self
            .broker
            .pending_info(&self.stream_key, self.profile.group_name(), id, id, 1)
            .await
            .map_err(Error::Broker)?;

        Ok(pending.into_iter().next())
    }

    /// Appends a dead letter built from `entry` to the dead-letter stream.
    ///
    /// The origin entry is not acknowledged here.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    pub async fn forward_to_dead_letter(
        &self,
        entry: &StreamEntry,
        times_delivered: u64,
    ) -> Result<EntryId, Error<B::Error>> {
        let letter = DeadLetterEntry::from_origin(
            entry,
            self.profile.consumer_name(),
            times_delivered,
            self.clock.now(),
        );

        let id = self
            .broker
            .append(&self.dead_letter_key, letter.to_fields())
            .await
            .map_err(Error::Broker)?;

        warn!(
            stream = %self.stream_key,
            dead_letter_stream = %self.dead_letter_key,
            original_id = %entry.id,
            dead_letter_id = %id,
            event_type = %entry.event_type,
            retries = times_delivered,
            "moved entry to dead-letter stream"
        );

        Ok(id)
    }
}
