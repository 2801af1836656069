//! In-process stream broker with consumer-group semantics
//!
//! Append-only named streams with approximate maxlen trimming, per-group
//! delivery cursors, and per-consumer pending-entry lists. Semantics match
//! what the processors need from a durable broker: at-least-once delivery,
//! explicit ack, pending redelivery after a crash. Workers share a broker
//! handle (`Arc<Broker>`) and otherwise never touch each other's state.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

use crate::error::SignalError;

/// One entry in a stream: a monotonically increasing id plus the payload.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: u64,
    pub payload: String,
}

struct GroupState {
    /// Next entry id to deliver to this group.
    cursor: u64,
    /// consumer name -> unacknowledged deliveries.
    pending: HashMap<String, BTreeMap<u64, String>>,
}

struct StreamState {
    entries: VecDeque<StreamEntry>,
    next_id: u64,
    maxlen: usize,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn new(maxlen: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            maxlen,
            groups: HashMap::new(),
        }
    }

    fn first_id(&self) -> u64 {
        self.entries.front().map(|e| e.id).unwrap_or(self.next_id)
    }
}

/// The broker. All methods are cheap; the only await point is the blocking
/// read, which parks on a notifier until something is published.
pub struct Broker {
    streams: Mutex<HashMap<String, StreamState>>,
    publish_notify: Notify,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            publish_notify: Notify::new(),
        }
    }

    /// Append a payload, trimming the stream to `maxlen` from the front.
    /// Returns the assigned entry id.
    pub fn publish(&self, stream: &str, payload: String, maxlen: usize) -> u64 {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(|| StreamState::new(maxlen));

        let id = state.next_id;
        state.next_id += 1;
        state.entries.push_back(StreamEntry { id, payload });
        while state.entries.len() > state.maxlen {
            state.entries.pop_front();
        }
        drop(streams);

        self.publish_notify.notify_waiters();
        id
    }

    /// Create a consumer group reading from the start of the stream.
    /// Idempotent; creates the stream if it does not exist yet.
    pub fn ensure_group(&self, stream: &str, group: &str, maxlen: usize) {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(|| StreamState::new(maxlen));
        let first = state.first_id();
        state.groups.entry(group.to_string()).or_insert(GroupState {
            cursor: first,
            pending: HashMap::new(),
        });
    }

    /// Deliver up to `count` new entries to `consumer`, advancing the group
    /// cursor and recording the deliveries as pending until acked. Blocks up
    /// to `block` when nothing is available, returning an empty batch on
    /// timeout.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, SignalError> {
        let deadline = Instant::now() + block;
        loop {
            let batch = self.try_read_group(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let notified = self.publish_notify.notified();
            tokio::pin!(notified);
            // Re-check after registering so a publish between the first read
            // and the registration is not missed.
            let batch = self.try_read_group(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let _ = timeout(deadline - now, notified).await;
        }
    }

    fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, SignalError> {
        let mut streams = self.streams.lock().unwrap();
        let Some(state) = streams.get_mut(stream) else {
            return Err(SignalError::TransientBus(format!(
                "stream {} not created; ensure_group first",
                stream
            )));
        };
        let first = state.first_id();
        let next = state.next_id;
        let Some(group_state) = state.groups.get_mut(group) else {
            return Err(SignalError::TransientBus(format!(
                "group {} missing on stream {}",
                group, stream
            )));
        };

        // Entries trimmed past the cursor are gone; skip forward.
        if group_state.cursor < first {
            group_state.cursor = first;
        }
        if group_state.cursor >= next {
            return Ok(Vec::new());
        }
        let start = group_state.cursor;

        let offset = (start - first) as usize;
        let batch: Vec<StreamEntry> = state
            .entries
            .iter()
            .skip(offset)
            .take(count)
            .cloned()
            .collect();

        if let Some(last) = batch.last() {
            let group_state = state.groups.get_mut(group).unwrap();
            group_state.cursor = last.id + 1;
            let pending = group_state.pending.entry(consumer.to_string()).or_default();
            for entry in &batch {
                pending.insert(entry.id, entry.payload.clone());
            }
        }
        Ok(batch)
    }

    /// This consumer's unacknowledged deliveries, oldest first. Used at
    /// startup to reclaim work lost to a crash.
    pub fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(consumer))
            .map(|pending| {
                pending
                    .iter()
                    .take(count)
                    .map(|(id, payload)| StreamEntry {
                        id: *id,
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Acknowledge processed entries, removing them from the pending list.
    pub fn ack(&self, stream: &str, group: &str, consumer: &str, ids: &[u64]) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(pending) = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.get_mut(consumer))
        {
            for id in ids {
                pending.remove(id);
            }
        }
    }

    pub fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Entries with id >= `from_id`, outside any group. Observability and
    /// test hook, not a consumption path.
    pub fn range(&self, stream: &str, from_id: u64) -> Vec<StreamEntry> {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| e.id >= from_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
