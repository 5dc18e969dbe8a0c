use std::time::Duration;

use eventrail_broker::StreamBroker;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::StreamChannel;
use crate::config::{ChannelProfile, MIN_BLOCK_TIME};
use crate::error::Error;
use crate::event::StreamEntry;
use crate::handler::{EventHandler, dispatch};

/// Counts of what one consumption cycle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entries claimed from other (or crashed) consumers.
    pub claimed: usize,

    /// Claimed entries handled successfully.
    pub reprocessed: usize,

    /// Claimed entries moved to the dead-letter stream.
    pub dead_lettered: usize,

    /// New entries handled successfully.
    pub consumed: usize,

    /// Handler failures; those entries stay pending.
    pub failed: usize,
}

/// Drives a handler over an origin stream: abandoned entries first, then new ones.
#[derive(Debug)]
pub struct ConsumptionDriver<B, P, H>
where
    B: StreamBroker,
    P: ChannelProfile,
    H: EventHandler,
{
    channel: StreamChannel<B, P>,
    handler: H,
    handler_timeout: Option<Duration>,
}

impl<B, P, H> ConsumptionDriver<B, P, H>
where
    B: StreamBroker,
    P: ChannelProfile,
    H: EventHandler,
{
    /// Creates a driver; handlers run without a time limit.
    pub const fn new(channel: StreamChannel<B, P>, handler: H) -> Self {
        Self {
            channel,
            handler,
            handler_timeout: None,
        }
    }

    /// Bounds each handler invocation; a timed-out entry counts as failed.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// The underlying channel.
    pub const fn channel(&self) -> &StreamChannel<B, P> {
        &self.channel
    }

    /// Runs one reclaim phase followed by one read of new entries.
    ///
    /// # Errors
    ///
    /// Returns an error if reading new entries fails. Reclaim and acknowledgment
    /// failures are logged and leave the affected entries pending.
    pub async fn run_once(&self) -> Result<CycleReport, Error<B::Error>> {
        let mut report = CycleReport::default();

        self.reclaim(&mut report).await;

        let entries = self.channel.get_unprocessed_events().await?;
        self.consume(entries, &mut report).await;

        Ok(report)
    }

    /// Runs cycles until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts a blocking read but never a running handler.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            stream = %self.channel.stream_key(),
            group = self.channel.profile().group_name(),
            consumer = self.channel.profile().consumer_name(),
            "consumption driver started"
        );

        while !shutdown.is_cancelled() {
            let mut report = CycleReport::default();
            self.reclaim(&mut report).await;

            if shutdown.is_cancelled() {
                break;
            }

            let read = tokio::select! {
                () = shutdown.cancelled() => break,
                read = self.channel.get_unprocessed_events() => read,
            };

            match read {
                Ok(entries) => {
                    self.consume(entries, &mut report).await;
                    if report != CycleReport::default() {
                        debug!(?report, "cycle finished");
                    }
                }
                Err(e) => {
                    error!(stream = %self.channel.stream_key(), error = %e, "read failed");

                    // Back off before the next read.
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(MIN_BLOCK_TIME) => {}
                    }
                }
            }
        }

        info!(stream = %self.channel.stream_key(), "consumption driver stopped");
    }

    async fn reclaim(&self, report: &mut CycleReport) {
        let claimed = self.channel.claim_abandoned().await;
        report.claimed += claimed.entries.len();

        let ceiling = self.channel.profile().max_times_delivered();

        for entry in claimed.entries {
            let times_delivered = match self.channel.pending_info(&entry.id).await {
                Ok(Some(pending)) => pending.times_delivered,
                Ok(None) => {
                    debug!(id = %entry.id, "claimed entry no longer pending");
                    continue;
                }
                Err(e) => {
                    // The claim reset the idle time; the next reclaim pass checks it again.
                    warn!(id = %entry.id, error = %e, "pending info unavailable, entry left pending");
                    continue;
                }
            };

            if times_delivered >= ceiling {
                match self
                    .channel
                    .forward_to_dead_letter(&entry, times_delivered)
                    .await
                {
                    Ok(_) => {
                        self.channel.acknowledge(&entry.id).await;
                        report.dead_lettered += 1;
                    }
                    Err(e) => {
                        error!(id = %entry.id, error = %e, "dead-letter forwarding failed");
                    }
                }
                continue;
            }

            if self.handle(&entry).await {
                report.reprocessed += 1;
            } else {
                report.failed += 1;
            }
        }
    }

    async fn consume(&self, entries: Vec<StreamEntry>, report: &mut CycleReport) {
        for entry in entries {
            if self.handle(&entry).await {
                report.consumed += 1;
            } else {
                report.failed += 1;
            }
        }
    }

    /// Invokes the handler and acknowledges on success.
    async fn handle(&self, entry: &StreamEntry) -> bool {
        let id = entry.id.clone();

        match dispatch(self.handler_timeout, self.handler.handle(entry.clone())).await {
            Ok(()) => {
                self.channel.acknowledge(&id).await;
                true
            }
            Err(reason) => {
                warn!(%id, event_type = %entry.event_type, error = %reason, "handler failed, entry stays pending");
                false
            }
        }
    }
}
