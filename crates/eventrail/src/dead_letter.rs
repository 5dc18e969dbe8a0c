use std::collections::BTreeSet;
use std::time::Duration;

use eventrail_broker::{GroupStart, StreamBroker};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::StreamChannel;
use crate::clock::WallClock;
use crate::config::{ChannelProfile, EventStreamConfig, MIN_BLOCK_TIME};
use crate::error::Error;
use crate::event::DeadLetterEntry;
use crate::handler::{DeadLetterHandler, dispatch};

/// Selects the dead letters a reprocessing consumer acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReprocessFilter {
    service: String,
    event_types: BTreeSet<String>,
}

impl ReprocessFilter {
    /// Matches every dead letter published by `service`.
    pub fn new<S: Into<String>>(service: S) -> Self {
        Self {
            service: service.into(),
            event_types: BTreeSet::new(),
        }
    }

    /// Restricts matching to the given event types.
    #[must_use]
    pub fn with_event_types<I, T>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    /// The service whose letters are accepted.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether a dead letter should be reprocessed.
    #[must_use]
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        entry.service == self.service
            && (self.event_types.is_empty() || self.event_types.contains(&entry.event_type))
    }
}

/// Counts of what one dead-letter pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Dead letters read.
    pub received: usize,

    /// Dead letters handled and acknowledged.
    pub handled: usize,

    /// Dead letters acknowledged without handling because the filter rejected them.
    pub skipped: usize,

    /// Handler failures; those dead letters stay pending.
    pub failed: usize,
}

/// Entry point for consuming the dead-letter stream.
#[derive(Clone, Debug)]
pub struct DeadLetterChannel<B>
where
    B: StreamBroker,
{
    broker: B,
    clock: WallClock,
    key: String,
    service: String,
}

impl<B> DeadLetterChannel<B>
where
    B: StreamBroker,
{
    /// Creates a dead-letter channel over `key`.
    pub fn new<K, S>(broker: B, key: K, service: S) -> Self
    where
        K: Into<String>,
        S: Into<String>,
    {
        Self {
            broker,
            clock: WallClock::default(),
            key: key.into(),
            service: service.into(),
        }
    }

    /// Creates a channel over the configured dead-letter stream.
    pub fn from_config(broker: B, config: &EventStreamConfig) -> Self {
        Self {
            clock: WallClock::new(config.timezone),
            ..Self::new(
                broker,
                config.dead_letter_stream_key(),
                config.service_name.clone(),
            )
        }
    }

    /// The dead-letter stream key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The service whose letters a reprocessor built here accepts.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn channel<P: ChannelProfile>(&self, profile: P, start: GroupStart) -> StreamChannel<B, P> {
        StreamChannel::new(self.broker.clone(), self.key.clone(), self.service.clone(), profile)
            .with_clock(self.clock)
            .with_group_start(start)
    }

    /// A consumer that hands this service's own dead letters back to `handler`.
    ///
    /// Only letters published by this channel's service are reprocessed, and of
    /// those only the given `event_types`; an empty list accepts every type of
    /// the service. Its group starts at the beginning of the stream, so letters
    /// moved before the group existed are reprocessed too.
    pub fn reprocessor<P, H, I, T>(
        &self,
        profile: P,
        event_types: I,
        handler: H,
    ) -> Reprocessor<B, P, H>
    where
        P: ChannelProfile,
        H: DeadLetterHandler,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Reprocessor {
            channel: self.channel(profile, GroupStart::Beginning),
            filter: ReprocessFilter::new(self.service.clone()).with_event_types(event_types),
            handler,
            handler_timeout: None,
        }
    }

    /// A consumer that passes every new dead letter, from any service, to `handler`.
    ///
    /// Its group is created "from now": letters moved before it existed are
    /// never delivered.
    pub fn notifier<P, H>(&self, profile: P, handler: H) -> Notifier<B, P, H>
    where
        P: ChannelProfile,
        H: DeadLetterHandler,
    {
        Notifier {
            channel: self.channel(profile, GroupStart::Latest),
            handler,
            handler_timeout: None,
        }
    }
}

/// Dead-letter consumer in reprocessing mode.
#[derive(Debug)]
pub struct Reprocessor<B, P, H>
where
    B: StreamBroker,
    P: ChannelProfile,
    H: DeadLetterHandler,
{
    channel: StreamChannel<B, P>,
    filter: ReprocessFilter,
    handler: H,
    handler_timeout: Option<Duration>,
}

impl<B, P, H> Reprocessor<B, P, H>
where
    B: StreamBroker,
    P: ChannelProfile,
    H: DeadLetterHandler,
{
    /// Bounds each handler invocation.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// The filter in use.
    pub const fn filter(&self) -> &ReprocessFilter {
        &self.filter
    }

    /// Reads one batch and reprocesses the matching letters.
    ///
    /// Non-matching letters are acknowledged for this group and left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn poll_once(&self) -> Result<PassReport, Error<B::Error>> {
        let entries = self.channel.read_entries::<DeadLetterEntry>().await?;
        Ok(self.process(entries).await)
    }

    async fn process(&self, entries: Vec<DeadLetterEntry>) -> PassReport {
        let mut report = PassReport {
            received: entries.len(),
            ..PassReport::default()
        };

        for entry in entries {
            if !self.filter.matches(&entry) {
                debug!(id = %entry.id, service = %entry.service, event_type = %entry.event_type, "dead letter filtered out");
                self.channel.acknowledge(&entry.id).await;
                report.skipped += 1;
                continue;
            }

            if handle(&self.channel, &self.handler, self.handler_timeout, entry).await {
                report.handled += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    /// Polls until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts a blocking read but never a running handler.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(stream = %self.channel.stream_key(), group = self.channel.profile().group_name(), "dead-letter reprocessor started");

        while let Some(entries) = read_until(&self.channel, &shutdown).await {
            let report = self.process(entries).await;
            if report.received > 0 {
                debug!(?report, "dead-letter pass finished");
            }
        }

        info!(stream = %self.channel.stream_key(), "dead-letter reprocessor stopped");
    }
}

/// Dead-letter consumer in notification mode.
#[derive(Debug)]
pub struct Notifier<B, P, H>
where
    B: StreamBroker,
    P: ChannelProfile,
    H: DeadLetterHandler,
{
    channel: StreamChannel<B, P>,
    handler: H,
    handler_timeout: Option<Duration>,
}

impl<B, P, H> Notifier<B, P, H>
where
    B: StreamBroker,
    P: ChannelProfile,
    H: DeadLetterHandler,
{
    /// Bounds each handler invocation.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Reads one batch and passes every letter to the handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn poll_once(&self) -> Result<PassReport, Error<B::Error>> {
        let entries = self.channel.read_entries::<DeadLetterEntry>().await?;
        Ok(self.process(entries).await)
    }

    async fn process(&self, entries: Vec<DeadLetterEntry>) -> PassReport {
        let mut report = PassReport {
            received: entries.len(),
            ..PassReport::default()
        };

        for entry in entries {
            if handle(&self.channel, &self.handler, self.handler_timeout, entry).await {
                report.handled += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    /// Polls until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts a blocking read but never a running handler.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(stream = %self.channel.stream_key(), group = self.channel.profile().group_name(), "dead-letter notifier started");

        while let Some(entries) = read_until(&self.channel, &shutdown).await {
            let report = self.process(entries).await;
            if report.received > 0 {
                debug!(?report, "dead-letter pass finished");
            }
        }

        info!(stream = %self.channel.stream_key(), "dead-letter notifier stopped");
    }
}

async fn handle<B, P, H>(
    channel: &StreamChannel<B, P>,
    handler: &H,
    timeout: Option<Duration>,
    entry: DeadLetterEntry,
) -> bool
where
    B: StreamBroker,
    P: ChannelProfile,
    H: DeadLetterHandler,
{
    let id = entry.id.clone();
    let original_id = entry.original_id.clone();

    match dispatch(timeout, handler.handle(entry)).await {
        Ok(()) => {
            channel.acknowledge(&id).await;
            true
        }
        Err(reason) => {
            warn!(%id, %original_id, error = %reason, "dead-letter handler failed, letter stays pending");
            false
        }
    }
}

/// Reads the next batch, or `None` once `shutdown` is cancelled.
async fn read_until<B, P>(
    channel: &StreamChannel<B, P>,
    shutdown: &CancellationToken,
) -> Option<Vec<DeadLetterEntry>>
where
    B: StreamBroker,
    P: ChannelProfile,
{
    loop {
        if shutdown.is_cancelled() {
            return None;
        }

        let read = tokio::select! {
            () = shutdown.cancelled() => return None,
            read = channel.read_entries::<DeadLetterEntry>() => read,
        };

        match read {
            Ok(entries) => return Some(entries),
            Err(e) => {
                error!(stream = %channel.stream_key(), error = %e, "dead-letter read failed");
                tokio::select! {
                    () = shutdown.cancelled() => return None,
                    () = tokio::time::sleep(MIN_BLOCK_TIME) => {}
                }
            }
        }
    }
}
