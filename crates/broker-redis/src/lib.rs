//! Redis Streams implementation of the broker interface.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventrail_broker::{
    AutoClaim, EntryId, Fields, GroupInfo, GroupStart, PendingEntry, RawEntry, ReadOffset,
    StreamBroker,
};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamId, StreamInfoGroupsReply, StreamPendingCountReply, StreamRangeReply, StreamReadReply,
};
use redis::{Client, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Configuration for the `RedisBroker`.
#[derive(Clone, Debug)]
pub struct RedisBrokerConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
}

/// A broker backed by Redis Streams.
///
/// Non-blocking commands share one auto-reconnecting connection. Blocking
/// `XREADGROUP` calls would stall every command multiplexed behind them, so they
/// run on dedicated connections checked out of a small idle pool.
#[derive(Clone)]
pub struct RedisBroker {
    blocking_pool: Arc<Mutex<Vec<MultiplexedConnection>>>,
    client: Client,
    manager: ConnectionManager,
    url: String,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").field("url", &self.url).finish()
    }
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(RedisBrokerConfig { url }: RedisBrokerConfig) -> Result<Self, Error> {
        let client = Client::open(url.as_str())?;
        let manager = ConnectionManager::new(client.clone()).await?;

        debug!(url = %url, "connected to redis");

        Ok(Self {
            blocking_pool: Arc::new(Mutex::new(Vec::new())),
            client,
            manager,
            url,
        })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, Error> {
        if let Some(connection) = self.blocking_pool.lock().await.pop() {
            return Ok(connection);
        }

        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn checkin_blocking(&self, connection: MultiplexedConnection) {
        self.blocking_pool.lock().await.push(connection);
    }
}

fn raw_entry(stream_id: StreamId) -> Result<RawEntry, Error> {
    let mut fields = Fields::new();

    for (key, value) in stream_id.map {
        if value == Value::Nil {
            continue;
        }
        fields.insert(key, redis::from_redis_value(&value)?);
    }

    Ok(RawEntry {
        id: stream_id.id.into(),
        fields,
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_auto_claim(parts: &[Value]) -> Result<AutoClaim, Error> {
    let unexpected = |reason: &str| Error::UnexpectedReply {
        command: "XAUTOCLAIM",
        reason: reason.to_string(),
    };

    let cursor = parts.first().ok_or_else(|| unexpected("missing cursor"))?;
    let claimed = parts.get(1).ok_or_else(|| unexpected("missing entries"))?;

    let next_cursor: String = redis::from_redis_value(cursor)?;
    let claimed: StreamRangeReply = redis::from_redis_value(claimed)?;

    // Redis < 7 replies with two elements only.
    let deleted: Vec<String> = match parts.get(2) {
        Some(value) => redis::from_redis_value(value)?,
        None => Vec::new(),
    };

    Ok(AutoClaim {
        next_cursor: next_cursor.into(),
        entries: claimed
            .ids
            .into_iter()
            .map(raw_entry)
            .collect::<Result<_, _>>()?,
        deleted: deleted.into_iter().map(EntryId::from).collect(),
    })
}

#[async_trait]
impl StreamBroker for RedisBroker {
    type Error = Error;

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, Self::Error> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in &fields {
            cmd.arg(key).arg(value);
        }

        let id: String = cmd.query_async(&mut self.manager.clone()).await?;

        Ok(id.into())
    }

    #[instrument(skip(self))]
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), Self::Error> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start.as_str());
        if mkstream {
            cmd.arg("MKSTREAM");
        }

        let () = cmd.query_async(&mut self.manager.clone()).await?;

        Ok(())
    }

    async fn list_groups(&self, stream: &str) -> Result<Vec<GroupInfo>, Self::Error> {
        let reply: StreamInfoGroupsReply = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut self.manager.clone())
            .await?;

        Ok(reply
            .groups
            .into_iter()
            .map(|group| GroupInfo {
                name: group.name,
                consumers: group.consumers as u64,
                pending: group.pending as u64,
                last_delivered_id: group.last_delivered_id.into(),
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
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);

        // BLOCK only applies to `>`; history reads answer immediately.
        let block = block.filter(|_| offset == ReadOffset::New);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(millis(block).max(1));
        }
        cmd.arg("STREAMS").arg(stream).arg(offset.as_arg());

        let reply: Option<StreamReadReply> = if block.is_some() {
            let mut connection = self.checkout_blocking().await?;
            let reply = cmd.query_async(&mut connection).await?;
            self.checkin_blocking(connection).await;
            reply
        } else {
            cmd.query_async(&mut self.manager.clone()).await?
        };

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        reply
            .keys
            .into_iter()
            .filter(|key| key.key == stream)
            .flat_map(|key| key.ids)
            .map(raw_entry)
            .collect()
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, Self::Error> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.as_str());
        }

        let acked: u64 = cmd.query_async(&mut self.manager.clone()).await?;

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
        let parts: Vec<Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(millis(min_idle))
            .arg(start.as_str())
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.manager.clone())
            .await?;

        parse_auto_claim(&parts)
    }

    async fn pending_info(
        &self,
        stream: &str,
        group: &str,
        start: &EntryId,
        end: &EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Self::Error> {
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(start.as_str())
            .arg(end.as_str())
            .arg(count)
            .query_async(&mut self.manager.clone())
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|pending| PendingEntry {
                id: pending.id.into(),
                consumer: pending.consumer,
                idle: Duration::from_millis(pending.last_delivered_ms as u64),
                times_delivered: pending.times_delivered as u64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use eventrail_broker::BrokerError;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_raw_entry_skips_nil_fields() {
        let stream_id = StreamId {
            id: "1-0".to_string(),
            map: HashMap::from([
                ("type".to_string(), bulk("order.created")),
                ("gone".to_string(), Value::Nil),
            ]),
        };

        let entry = raw_entry(stream_id).unwrap();

        assert_eq!(entry.id.as_str(), "1-0");
        assert_eq!(entry.fields.len(), 1);
        assert_eq!(entry.fields["type"], "order.created");
    }

    #[test]
    fn test_parse_auto_claim_two_element_reply() {
        let parts = vec![bulk("0-0"), Value::Array(vec![])];

        let claim = parse_auto_claim(&parts).unwrap();

        assert!(claim.next_cursor.is_zero());
        assert!(claim.entries.is_empty());
        assert!(claim.deleted.is_empty());
    }

    #[test]
    fn test_parse_auto_claim_missing_parts() {
        let result = parse_auto_claim(&[]);

        assert!(matches!(
            result,
            Err(Error::UnexpectedReply {
                command: "XAUTOCLAIM",
                ..
            })
        ));
    }

    // The tests below need a Redis server on localhost:6379.

    async fn connect() -> RedisBroker {
        RedisBroker::connect(RedisBrokerConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        })
        .await
        .expect("Failed to connect to Redis")
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_group_lifecycle() {
        let broker = connect().await;
        let stream = format!("eventrail-test:{}", uuid::Uuid::new_v4());

        broker
            .create_group(&stream, "g", GroupStart::Beginning, true)
            .await
            .expect("Failed to create group");

        let again = broker
            .create_group(&stream, "g", GroupStart::Beginning, true)
            .await;
        assert!(again.unwrap_err().is_group_exists());

        let id = broker
            .append(&stream, Fields::from([("type".to_string(), "t".to_string())]))
            .await
            .expect("Failed to append");

        let entries = broker
            .read_group(&stream, "g", "c", ReadOffset::New, 10, Some(Duration::from_millis(100)))
            .await
            .expect("Failed to read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);

        let pending = broker
            .pending_info(&stream, "g", &id, &id, 1)
            .await
            .expect("Failed to read pending");
        assert_eq!(pending[0].times_delivered, 1);

        let claim = broker
            .auto_claim(&stream, "g", "other", Duration::ZERO, &EntryId::zero(), 10)
            .await
            .expect("Failed to claim");
        assert_eq!(claim.entries.len(), 1);

        assert_eq!(broker.ack(&stream, "g", &[id.clone()]).await.unwrap(), 1);
        assert_eq!(broker.ack(&stream, "g", &[id]).await.unwrap(), 0);
    }
}
