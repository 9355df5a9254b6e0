//! Redis-backed substrate.
//!
//! Regular commands share one auto-reconnecting multiplexed connection. Blocking stream reads
//! (`XREADGROUP ... BLOCK`) stall the connection they run on, so they get a dedicated one.
//! Pub/sub subscriptions each open their own connection.

use super::{
    AutoClaim, KvStore, PubSub, StoreError, StreamAppend, StreamRecord, StreamStore, StreamTrim,
    Subscription,
};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{
    aio::ConnectionManager,
    streams::{StreamMaxlen, StreamPendingReply, StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, FromRedisValue, RedisError, Value,
};
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info};

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        match e.code() {
            Some("BUSYGROUP") => Self::GroupExists,
            Some("NOGROUP") => Self::NoGroup(e.to_string()),
            _ if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() => {
                Self::Connection(e.to_string())
            }
            _ => Self::Command(e.to_string()),
        }
    }
}

fn to_maxlen(trim: StreamTrim) -> StreamMaxlen {
    match trim {
        StreamTrim::Approx(n) => StreamMaxlen::Approx(usize::try_from(n).unwrap_or(usize::MAX)),
        StreamTrim::Exact(n) => StreamMaxlen::Equals(usize::try_from(n).unwrap_or(usize::MAX)),
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn record_from_fields(id: String, map: &HashMap<String, Value>) -> StreamRecord {
    let fields = map
        .iter()
        .filter_map(|(k, v)| String::from_redis_value(v).ok().map(|v| (k.clone(), v)))
        .collect();
    StreamRecord { id, fields }
}

/// Parses an `XAUTOCLAIM` reply: `[next_id, [[id, [f, v, ...]] | nil, ...], (deleted ids)]`.
fn parse_auto_claim(value: &Value) -> Result<AutoClaim, StoreError> {
    let Value::Array(items) = value else {
        return Err(StoreError::Reply(format!("XAUTOCLAIM: expected array, got {value:?}")));
    };
    let next = items
        .first()
        .ok_or_else(|| StoreError::Reply("XAUTOCLAIM: empty reply".to_string()))?;
    let next_start = String::from_redis_value(next).map_err(|e| StoreError::Reply(e.to_string()))?;

    let entries: Vec<Option<(String, Option<HashMap<String, String>>)>> = match items.get(1) {
        Some(v) => FromRedisValue::from_redis_value(v).map_err(|e| StoreError::Reply(e.to_string()))?,
        None => Vec::new(),
    };

    let claimed = entries
        .into_iter()
        .flatten()
        .filter_map(|(id, fields)| fields.map(|fields| StreamRecord { id, fields }))
        .collect();

    Ok(AutoClaim { next_start, claimed })
}

/// Substrate backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking_conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to `url` (`redis://host:port/db`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let blocking_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("connected to redis substrate");
        Ok(Self { client, conn, blocking_conn })
    }

    /// Round-trips a `PING`.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the server does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(duration_millis(ttl).max(1));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(duration_millis(ttl).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel, "subscribed");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() })
            .boxed();
        Ok(stream)
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
        trim: Option<StreamTrim>,
    ) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let id: String = match trim {
            Some(trim) => conn.xadd_maxlen(stream, to_maxlen(trim), "*", fields).await?,
            None => conn.xadd(stream, "*", fields).await?,
        };
        Ok(id)
    }

    async fn xadd_batch(
        &self,
        entries: &[StreamAppend],
        trim: Option<StreamTrim>,
    ) -> Result<Vec<String>, StoreError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for entry in entries {
            match trim {
                Some(trim) => pipe.xadd_maxlen(&entry.stream, to_maxlen(trim), "*", &entry.fields),
                None => pipe.xadd(&entry.stream, "*", &entry.fields),
            };
        }

        let mut conn = self.conn.clone();
        let ids: Vec<String> = pipe.query_async(&mut conn).await?;
        Ok(ids)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.xgroup_create_mkstream(stream, group, start_id).await?;
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));

        let mut conn = self.blocking_conn.clone();
        let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[">"], &opts).await?;

        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|sid| record_from_fields(sid.id, &sid.map))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<AutoClaim, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(duration_millis(min_idle))
            .arg(start)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        parse_auto_claim(&reply)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(reply.count() as u64)
    }

    async fn len(&self, stream: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }
}
