//! In-process substrate.
//!
//! Implements the same observable semantics as the Redis adapter: TTL expiry on read,
//! `SET NX`, fan-out pub/sub, and streams with consumer groups, per-group pending entry
//! lists, blocking reads and idle reclaim. A block of zero means "do not wait".

use super::{
    glob_match, AutoClaim, KvStore, PubSub, StoreError, StreamAppend, StreamRecord, StreamStore,
    StreamTrim, Subscription,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    sync::{broadcast, Notify},
    time::Instant,
};

const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
struct EntryId(u64, u64);

impl EntryId {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "-" | "0" => Some(Self(0, 0)),
            _ => {
                let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
                Some(Self(ms.parse().ok()?, seq.parse().ok()?))
            }
        }
    }

    fn render(self) -> String {
        format!("{}-{}", self.0, self.1)
    }
}

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, fields: &[(String, String)], trim: Option<StreamTrim>) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let id = if now_ms > self.last_id.0 {
            EntryId(now_ms, 0)
        } else {
            EntryId(self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        self.entries.insert(id, fields.iter().cloned().collect());

        if let Some(StreamTrim::Approx(max) | StreamTrim::Exact(max)) = trim {
            let max = usize::try_from(max).unwrap_or(usize::MAX);
            while self.entries.len() > max {
                self.entries.pop_first();
            }
        }
        id
    }
}

/// Substrate held entirely in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    kv: Arc<Mutex<HashMap<String, KvEntry>>>,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    stream_notify: Arc<Notify>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(PUBSUB_CAPACITY).0)
            .clone()
    }

    fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::NoGroup(format!("{stream}/{group}")))?;
        let StreamState { entries, groups, .. } = state;
        let group_state =
            groups.get_mut(group).ok_or_else(|| StoreError::NoGroup(format!("{stream}/{group}")))?;

        let now = Instant::now();
        let mut out = Vec::new();
        let start = group_state.last_delivered;
        for (id, fields) in entries.range(EntryId(start.0, start.1.saturating_add(1))..).take(count) {
            group_state
                .pending
                .insert(*id, PendingEntry { consumer: consumer.to_string(), delivered_at: now });
            group_state.last_delivered = *id;
            out.push(StreamRecord { id: id.render(), fields: fields.clone() });
        }
        Ok(out)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut kv = self.kv.lock();
        match kv.get(key).map(|e| (e.is_live(), e.value.clone())) {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let entry = KvEntry { value: value.to_string(), expires_at: ttl.map(|t| Instant::now() + t) };
        self.kv.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut kv = self.kv.lock();
        if kv.get(key).is_some_and(KvEntry::is_live) {
            return Ok(false);
        }
        kv.insert(
            key.to_string(),
            KvEntry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.kv.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let kv = self.kv.lock();
        Ok(kv
            .iter()
            .filter(|(k, e)| e.is_live() && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // No subscribers is not an error, matching PUBLISH returning 0.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let rx = self.sender(channel).subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
        trim: Option<StreamTrim>,
    ) -> Result<String, StoreError> {
        let id = self.streams.lock().entry(stream.to_string()).or_default().append(fields, trim);
        self.stream_notify.notify_waiters();
        Ok(id.render())
    }

    async fn xadd_batch(
        &self,
        entries: &[StreamAppend],
        trim: Option<StreamTrim>,
    ) -> Result<Vec<String>, StoreError> {
        let ids = {
            let mut streams = self.streams.lock();
            entries
                .iter()
                .map(|e| {
                    streams.entry(e.stream.clone()).or_default().append(&e.fields, trim).render()
                })
                .collect()
        };
        self.stream_notify.notify_waiters();
        Ok(ids)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Err(StoreError::GroupExists);
        }
        let last_delivered = if start_id == "$" {
            state.last_id
        } else {
            EntryId::parse(start_id)
                .ok_or_else(|| StoreError::Command(format!("invalid stream ID: {start_id}")))?
        };
        state.groups.insert(group.to_string(), GroupState { last_delivered, ..Default::default() });
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
        let deadline = Instant::now() + block;
        loop {
            let notified = self.stream_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.try_read_group(stream, group, consumer, count)?;
            if !records.is_empty() {
                return Ok(records);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
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
        let start = EntryId::parse(start)
            .ok_or_else(|| StoreError::Command(format!("invalid stream ID: {start}")))?;

        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::NoGroup(format!("{stream}/{group}")))?;
        let StreamState { entries, groups, .. } = state;
        let group_state =
            groups.get_mut(group).ok_or_else(|| StoreError::NoGroup(format!("{stream}/{group}")))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut deleted = Vec::new();
        let mut next_start = EntryId::default();

        for (id, pending) in group_state.pending.range_mut(start..) {
            if claimed.len() >= count {
                next_start = *id;
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    claimed.push(StreamRecord { id: id.render(), fields: fields.clone() });
                }
                None => deleted.push(*id),
            }
        }
        for id in deleted {
            group_state.pending.remove(&id);
        }

        Ok(AutoClaim { next_start: next_start.render(), claimed })
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        let mut streams = self.streams.lock();
        let Some(group_state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter_map(|id| EntryId::parse(id))
            .filter(|id| group_state.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StoreError> {
        let streams = self.streams.lock();
        let group_state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| StoreError::NoGroup(format!("{stream}/{group}")))?;
        Ok(group_state.pending.len() as u64)
    }

    async fn len(&self, stream: &str) -> Result<u64, StoreError> {
        Ok(self.streams.lock().get(stream).map_or(0, |s| s.entries.len() as u64))
    }
}

impl MemoryStore {
    /// Consumer currently owning a pending entry, for assertions in tests.
    #[must_use]
    pub fn pending_owner(&self, stream: &str, group: &str, id: &str) -> Option<String> {
        let id = EntryId::parse(id)?;
        let streams = self.streams.lock();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(&id))
            .map(|p| p.consumer.clone())
    }
}
