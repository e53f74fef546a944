//! Bounded, deduplicated message cache.
//!
//! Entries are keyed by message id. Display order is newest-first by parsed
//! timestamp, unparseable timestamps after valid ones, ties broken by the
//! larger id. Eviction is by arrival order instead, so a message that shows
//! up late with an old timestamp is not thrown out the moment it lands.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    model::Message,
    settings::normalize_cache_limit,
};

#[derive(Debug)]
struct Entry {
    message: Arc<Message>,
    parsed_timestamp: Option<i64>,
    arrival: u64,
}

impl Entry {
    fn order_key(&self) -> (bool, Reverse<Option<i64>>, Reverse<i64>) {
        (
            self.parsed_timestamp.is_none(),
            Reverse(self.parsed_timestamp),
            Reverse(self.message.id),
        )
    }
}

#[derive(Debug)]
struct CacheInner {
    limit: usize,
    entries: HashMap<i64, Entry>,
    by_arrival: BTreeMap<u64, i64>,
    next_arrival: u64,
    /// Bumped on every change that alters the contents.
    revision: u64,
}

impl CacheInner {
    fn snapshot(&self) -> Vec<Arc<Message>> {
        let mut ordered: Vec<&Entry> = self.entries.values().collect();
        ordered.sort_by_key(|entry| entry.order_key());
        ordered
            .into_iter()
            .map(|entry| Arc::clone(&entry.message))
            .collect()
    }

    fn evict_over_limit(&mut self) -> Vec<i64> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.limit {
            let Some((_, id)) = self.by_arrival.pop_first() else {
                break;
            };
            self.entries.remove(&id);
            evicted.push(id);
        }
        evicted
    }
}

/// Result of a merge: the new snapshot plus what moved.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub snapshot: Vec<Arc<Message>>,
    /// Ids that were not cached before and survived eviction.
    pub inserted: Vec<i64>,
    /// Ids whose content changed.
    pub updated: Vec<i64>,
    pub evicted: Vec<i64>,
    /// Cache revision `snapshot` was taken at.
    pub revision: u64,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !self.inserted.is_empty() || !self.updated.is_empty() || !self.evicted.is_empty()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.snapshot.iter().map(|message| (**message).clone()).collect()
    }
}

#[derive(Debug)]
pub struct MessageCache {
    inner: Mutex<CacheInner>,
}

impl MessageCache {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                limit: normalize_cache_limit(limit),
                entries: HashMap::new(),
                by_arrival: BTreeMap::new(),
                next_arrival: 0,
                revision: 0,
            }),
        }
    }

    /// Seeds the cache from a persisted snapshot in display order. Arrival
    /// order is not persisted, so the oldest displayed entry counts as the
    /// earliest arrival.
    pub fn with_messages(limit: usize, messages: Vec<Message>) -> Result<Self> {
        let cache = Self::new(limit);
        let mut seed = messages;
        seed.reverse();
        cache.merge(seed)?;
        Ok(cache)
    }

    /// Folds `incoming` into the cache, in sequence order.
    ///
    /// An entry identical to the cached one keeps its existing `Arc`. An empty
    /// batch changes nothing: an empty response is never taken as "the server
    /// has no messages".
    pub fn merge(&self, incoming: Vec<Message>) -> Result<MergeOutcome> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let mut outcome = MergeOutcome::default();

        if incoming.is_empty() {
            outcome.snapshot = inner.snapshot();
            outcome.revision = inner.revision;
            return Ok(outcome);
        }

        for message in incoming {
            let id = message.id;
            let parsed_timestamp = message.parsed_timestamp();
            match inner.entries.get_mut(&id) {
                Some(existing) if *existing.message == message => {}
                Some(existing) => {
                    existing.message = Arc::new(message);
                    existing.parsed_timestamp = parsed_timestamp;
                    if !outcome.updated.contains(&id) && !outcome.inserted.contains(&id) {
                        outcome.updated.push(id);
                    }
                }
                None => {
                    let arrival = inner.next_arrival;
                    inner.next_arrival = inner.next_arrival.wrapping_add(1);
                    inner.by_arrival.insert(arrival, id);
                    inner.entries.insert(
                        id,
                        Entry {
                            message: Arc::new(message),
                            parsed_timestamp,
                            arrival,
                        },
                    );
                    outcome.inserted.push(id);
                    let evicted = inner.evict_over_limit();
                    outcome.evicted.extend(evicted);
                }
            }
        }

        outcome.inserted.retain(|id| !outcome.evicted.contains(id));
        outcome.updated.retain(|id| !outcome.evicted.contains(id));
        outcome.snapshot = inner.snapshot();
        if outcome.changed() {
            inner.revision += 1;
            debug!(
                inserted = outcome.inserted.len(),
                updated = outcome.updated.len(),
                evicted = outcome.evicted.len(),
                size = inner.entries.len(),
                "message cache merged"
            );
        }
        outcome.revision = inner.revision;
        Ok(outcome)
    }

    pub fn insert(&self, message: Message) -> Result<MergeOutcome> {
        self.merge(vec![message])
    }

    /// Drops an entry once the server has confirmed the delete.
    pub fn remove_confirmed(&self, id: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.entries.remove(&id) {
            Some(entry) => {
                inner.by_arrival.remove(&entry.arrival);
                inner.revision += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_limit(&self, limit: usize) -> Result<Vec<i64>> {
        let mut inner = self.lock()?;
        inner.limit = normalize_cache_limit(limit);
        let evicted = inner.evict_over_limit();
        if !evicted.is_empty() {
            inner.revision += 1;
        }
        Ok(evicted)
    }

    pub fn limit(&self) -> Result<usize> {
        Ok(self.lock()?.limit)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.entries.is_empty())
    }

    pub fn contains(&self, id: i64) -> Result<bool> {
        Ok(self.lock()?.entries.contains_key(&id))
    }

    pub fn get(&self, id: i64) -> Result<Option<Arc<Message>>> {
        Ok(self
            .lock()?
            .entries
            .get(&id)
            .map(|entry| Arc::clone(&entry.message)))
    }

    pub fn snapshot(&self) -> Result<Vec<Arc<Message>>> {
        Ok(self.lock()?.snapshot())
    }

    /// Current contents in display order, with the revision they belong to.
    pub fn revision_snapshot(&self) -> Result<(u64, Vec<Message>)> {
        let inner = self.lock()?;
        let messages = inner
            .snapshot()
            .iter()
            .map(|message| (**message).clone())
            .collect();
        Ok((inner.revision, messages))
    }

    pub fn messages(&self) -> Result<Vec<Message>> {
        Ok(self
            .snapshot()?
            .iter()
            .map(|message| (**message).clone())
            .collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CacheInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::lock_poisoned("Message cache"))
    }
}

/// Display order comparator, exposed for callers that sort their own copies.
pub fn display_order(a: &Message, b: &Message) -> Ordering {
    let key = |message: &Message| {
        let parsed = message.parsed_timestamp();
        (parsed.is_none(), Reverse(parsed), Reverse(message.id))
    };
    key(a).cmp(&key(b))
}
