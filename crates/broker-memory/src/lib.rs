//! In-memory (single process) broker with consumer-group semantics for tests
//! and local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use eventrail_broker::{
    AutoClaim, EntryId, Fields, GroupInfo, GroupStart, PendingEntry, RawEntry, ReadOffset,
    StreamBroker,
};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

type Key = (u64, u64);

fn to_id((ms, seq): Key) -> EntryId {
    EntryId::from_parts(ms, seq)
}

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    times_delivered: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    consumers: BTreeSet<String>,
    last_delivered: Key,
    pending: BTreeMap<Key, Pending>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<Key, Fields>,
    groups: BTreeMap<String, GroupState>,
    last_id: Key,
}

impl StreamState {
    fn next_id(&mut self) -> Key {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));

        let id = if now_ms > self.last_id.0 {
            (now_ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };

        self.last_id = id;
        id
    }
}

fn group_mut<'a>(
    streams: &'a mut HashMap<String, StreamState>,
    stream: &str,
    group: &str,
) -> Result<(&'a BTreeMap<Key, Fields>, &'a mut GroupState), Error> {
    let no_group = || Error::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    };

    let StreamState {
        entries, groups, ..
    } = streams.get_mut(stream).ok_or_else(no_group)?;
    let group_state = groups.get_mut(group).ok_or_else(no_group)?;

    Ok((&*entries, group_state))
}

/// In-memory broker.
///
/// Clones share state. Idle times are measured with [`tokio::time::Instant`], so
/// tests running on a paused clock can age pending entries with
/// `tokio::time::advance`.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    appended: Arc<Notify>,
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// Creates a new, empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with [`Error::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All entries currently stored in a stream, in log order.
    pub async fn entries(&self, stream: &str) -> Vec<RawEntry> {
        self.streams
            .lock()
            .await
            .get(stream)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .map(|(key, fields)| RawEntry {
                        id: to_id(*key),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of pending entries for a group (zero if the group does not exist).
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .and_then(|state| state.groups.get(group))
            .map_or(0, |group| group.pending.len())
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }

        Ok(())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>, Error> {
        let mut streams = self.streams.lock().await;
        let (entries, group_state) = group_mut(&mut streams, stream, group)?;
        group_state.consumers.insert(consumer.to_string());

        let batch: Vec<(Key, Fields)> = entries
            .range((Excluded(group_state.last_delivered), Unbounded))
            .take(count)
            .map(|(key, fields)| (*key, fields.clone()))
            .collect();

        let now = Instant::now();
        for (key, _) in &batch {
            group_state.pending.insert(
                *key,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    times_delivered: 1,
                },
            );
        }

        if let Some((key, _)) = batch.last() {
            group_state.last_delivered = *key;
        }

        Ok(batch
            .into_iter()
            .map(|(key, fields)| RawEntry {
                id: to_id(key),
                fields,
            })
            .collect())
    }

    async fn read_history(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: &EntryId,
        count: usize,
    ) -> Result<Vec<RawEntry>, Error> {
        let after = after.parts()?;

        let mut streams = self.streams.lock().await;
        let (entries, group_state) = group_mut(&mut streams, stream, group)?;
        group_state.consumers.insert(consumer.to_string());

        let now = Instant::now();
        let mut batch = Vec::new();

        for (key, pending) in group_state.pending.range_mut((Excluded(after), Unbounded)) {
            if batch.len() >= count {
                break;
            }

            if pending.consumer != consumer {
                continue;
            }

            pending.times_delivered += 1;
            pending.delivered_at = now;

            if let Some(fields) = entries.get(key) {
                batch.push(RawEntry {
                    id: to_id(*key),
                    fields: fields.clone(),
                });
            }
        }

        Ok(batch)
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    type Error = Error;

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, Self::Error> {
        self.check_available()?;

        let id = {
            let mut streams = self.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();
            let key = state.next_id();
            state.entries.insert(key, fields);
            to_id(key)
        };

        trace!(stream, %id, "appended entry");
        self.appended.notify_waiters();

        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), Self::Error> {
        self.check_available()?;

        let mut streams = self.streams.lock().await;
        let state = match streams.entry(stream.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) if mkstream => entry.insert(StreamState::default()),
            Entry::Vacant(_) => return Err(Error::NoSuchStream(stream.to_string())),
        };

        if state.groups.contains_key(group) {
            return Err(Error::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }

        let last_delivered = match start {
            GroupStart::Beginning => (0, 0),
            GroupStart::Latest => state.last_id,
        };

        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                ..GroupState::default()
            },
        );
        drop(streams);

        debug!(stream, group, start = start.as_str(), "created group");

        Ok(())
    }

    async fn list_groups(&self, stream: &str) -> Result<Vec<GroupInfo>, Self::Error> {
        self.check_available()?;

        let streams = self.streams.lock().await;
        let state = streams
            .get(stream)
            .ok_or_else(|| Error::NoSuchStream(stream.to_string()))?;

        Ok(state
            .groups
            .iter()
            .map(|(name, group)| GroupInfo {
                name: name.clone(),
                consumers: group.consumers.len() as u64,
                pending: group.pending.len() as u64,
                last_delivered_id: to_id(group.last_delivered),
            })
            .collect())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<RawEntry>, Self::Error> {
        self.check_available()?;

        match offset {
            ReadOffset::History(after) => {
                self.read_history(stream, group, consumer, &after, count)
                    .await
            }
            ReadOffset::New => {
                let deadline = block.map(|block| Instant::now() + block);

                loop {
                    // Registered before reading so an append in between still wakes us.
                    let appended = self.appended.notified();

                    let batch = self.read_new(stream, group, consumer, count).await?;
                    if !batch.is_empty() {
                        return Ok(batch);
                    }

                    let Some(deadline) = deadline else {
                        return Ok(batch);
                    };

                    if tokio::time::timeout_at(deadline, appended).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, Self::Error> {
        self.check_available()?;

        let mut streams = self.streams.lock().await;
        let Some(group_state) = streams
            .get_mut(stream)
            .and_then(|state| state.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(&id.parts()?).is_some() {
                acked += 1;
            }
        }

        Ok(acked)
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &EntryId,
        count: usize,
    ) -> Result<AutoClaim, Self::Error> {
        self.check_available()?;

        let start = start.parts()?;

        let mut streams = self.streams.lock().await;
        let (entries, group_state) = group_mut(&mut streams, stream, group)?;
        group_state.consumers.insert(consumer.to_string());

        let candidates: Vec<Key> = group_state.pending.range(start..).map(|(key, _)| *key).collect();
        let max_attempts = count.saturating_mul(10).max(1);
        let now = Instant::now();

        let mut claim = AutoClaim::default();
        let mut examined = 0;

        for key in candidates {
            if claim.entries.len() >= count || examined >= max_attempts {
                claim.next_cursor = to_id(key);
                break;
            }
            examined += 1;

            let Some(fields) = entries.get(&key) else {
                group_state.pending.remove(&key);
                claim.deleted.push(to_id(key));
                continue;
            };

            if let Some(pending) = group_state.pending.get_mut(&key) {
                if now.duration_since(pending.delivered_at) >= min_idle {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.times_delivered += 1;

                    claim.entries.push(RawEntry {
                        id: to_id(key),
                        fields: fields.clone(),
                    });
                }
            }
        }

        Ok(claim)
    }

    async fn pending_info(
        &self,
        stream: &str,
        group: &str,
        start: &EntryId,
        end: &EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Self::Error> {
        self.check_available()?;

        let (start, end) = (start.parts()?, end.parts()?);

        let streams = self.streams.lock().await;
        let group_state = streams
            .get(stream)
            .and_then(|state| state.groups.get(group))
            .ok_or_else(|| Error::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        if start > end {
            return Ok(Vec::new());
        }

        let now = Instant::now();

        Ok(group_state
            .pending
            .range(start..=end)
            .take(count)
            .map(|(key, pending)| PendingEntry {
                id: to_id(*key),
                consumer: pending.consumer.clone(),
                idle: now.duration_since(pending.delivered_at),
                times_delivered: pending.times_delivered,
            })
            .collect())
    }
}
