use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::FutureExt;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, FetchChannel, FetchId, FetchResult, Freshness, PendingFetch};
use crate::error::{FetchError, FetchFailure};
use crate::producer::Producer;


/// How many failures a lagging subscriber may miss before it starts losing the oldest ones.
const FAILURE_CHANNEL_CAPACITY: usize = 128;

/// Requirements for the keys of a [`CacheControl`].
///
/// Keys are opaque to the cache. Entries are kept, and scanned, in key order.
pub trait CacheKey: Ord + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Ord + Clone + fmt::Debug + Send + Sync + 'static {}

type EntryMap<K, V> = BTreeMap<K, CacheEntry<K, V>>;

/// A stale-while-revalidate cache in front of a [`Producer`].
///
/// Values are served straight from memory while they are *green*. Once a value leaves its green
/// period it is still served for another *red* period, while a refresh runs in the background.
/// Only when a value is past both windows, or there never was one, do callers wait for the
/// producer.
///
/// At most one producer call runs per key at any time: every caller interested in a key while a
/// fetch is in flight waits on that same fetch.
///
/// Failed fetches never discard a previously cached value. They are reported on the failure
/// stream returned by [`subscribe`](Self::subscribe), and only surface as an `Err` to callers
/// that were actually waiting on that fetch.
///
/// Fetches are spawned on the current tokio runtime, so the methods which may start a fetch
/// must be called from within one.
pub struct CacheControl<K: CacheKey, P: Producer<K>> {
    inner: Arc<Inner<K, P>>,
}

struct Inner<K: CacheKey, P: Producer<K>> {
    config: CacheConfig,
    producer: P,
    /// All entry mutations happen while holding this lock, which is never held across an await.
    entries: Mutex<EntryMap<K, P::Value>>,
    next_fetch_id: AtomicU64,
    failures: broadcast::Sender<FetchFailure<K>>,
}

impl<K: CacheKey, P: Producer<K>> Clone for CacheControl<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, P: Producer<K>> fmt::Debug for CacheControl<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, running) = self
            .inner
            .entries
            .try_lock()
            .map(|entries| {
                let running = entries.values().filter(|e| e.pending.is_some()).count();
                (entries.len(), running)
            })
            .unwrap_or_default();
        f.debug_struct("CacheControl")
            .field("config", &self.inner.config)
            .field("entries", &entries)
            .field("running fetches", &running)
            .finish()
    }
}

impl<K: CacheKey, P: Producer<K>> Inner<K, P> {
    fn entries(&self) -> MutexGuard<'_, EntryMap<K, P::Value>> {
        // Every critical section leaves the map consistent, so a poisoned lock is still usable.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_failure(&self, key: &K, error: &FetchError) {
        tracing::warn!(
            error = error as &dyn std::error::Error,
            ?key,
            "Fetch failed"
        );
        // Having no subscribers is fine.
        self.failures
            .send(FetchFailure {
                key: key.clone(),
                error: error.clone(),
            })
            .ok();
    }
}

impl<K: CacheKey, P: Producer<K>> CacheControl<K, P> {
    /// Creates an empty cache in front of `producer`.
    pub fn new(producer: P, config: CacheConfig) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                producer,
                entries: Mutex::new(BTreeMap::new()),
                next_fetch_id: AtomicU64::new(0),
                failures,
            }),
        }
    }

    /// The configuration this cache was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Subscribes to failed fetches.
    ///
    /// Every failed fetch is broadcast exactly once, regardless of whether it was started by
    /// [`get`](Self::get), [`update`](Self::update) or [`refresh`](Self::refresh), and whether
    /// or not anyone was waiting for it.
    pub fn subscribe(&self) -> broadcast::Receiver<FetchFailure<K>> {
        self.inner.failures.subscribe()
    }

    fn entries(&self) -> MutexGuard<'_, EntryMap<K, P::Value>> {
        self.inner.entries()
    }

    /// Returns a usable value for `key`, preferring cached data over waiting.
    ///
    /// - A missing value, or one past its green period, triggers a fetch unless one is already
    ///   running.
    /// - A value that is still servable is returned right away. Should the background fetch fail,
    ///   this is only reported on the failure stream.
    /// - Otherwise this waits for the in-flight fetch and returns its outcome.
    pub async fn get(&self, key: K) -> FetchResult<P::Value> {
        let channel = {
            let mut entries = self.entries();
            let now = Instant::now();
            let config = &self.inner.config;

            let entry = entries.get(&key);
            let valid = entry.and_then(|e| e.valid_value(now, config)).cloned();
            let needs_fetch = entry.is_none_or(|e| e.is_empty() || e.needs_refresh(now, config));

            let channel = needs_fetch.then(|| self.start_fetch(&mut entries, &key));

            if let Some(value) = valid {
                return Ok(value);
            }

            match channel {
                Some(channel) => channel,
                // An expired value that is already being refreshed
                None => self.start_fetch(&mut entries, &key),
            }
        };

        channel
            .await
            .unwrap_or_else(|_canceled| Err(FetchError::Canceled))
    }

    /// Returns the cached value only if it is within its green period.
    ///
    /// This never starts a fetch and never waits.
    pub fn get_green(&self, key: &K) -> Option<P::Value> {
        let now = Instant::now();
        self.entries()
            .get(key)
            .and_then(|entry| entry.green_value(now, &self.inner.config))
            .cloned()
    }

    /// Drops the cached value for `key`.
    ///
    /// With a fetch in flight only the value is dropped, and the fetch will still install its
    /// result once it completes. Otherwise the whole entry is removed.
    pub fn clear(&self, key: &K) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };

        if entry.pending.is_some() {
            tracing::trace!(?key, "Clearing value of entry with fetch in flight");
            entry.value = None;
        } else {
            tracing::trace!(?key, "Removing entry");
            entries.remove(key);
        }
    }

    /// Removes the entry for `key` if it is still garbage.
    ///
    /// Unlike a [`garbage`](Self::garbage) scan followed by [`clear`](Self::clear), this cannot
    /// evict an entry that was refreshed in the meantime. Returns whether the entry was removed.
    pub(crate) fn remove_if_garbage(&self, key: &K) -> bool {
        let now = Instant::now();
        let mut entries = self.entries();
        let is_garbage = entries
            .get(key)
            .is_some_and(|entry| entry.is_garbage(now, &self.inner.config));

        if is_garbage {
            tracing::trace!(?key, "Evicting garbage entry");
            entries.remove(key);
        }
        is_garbage
    }

    /// Fetches a new value for `key` regardless of its freshness, and waits for it.
    ///
    /// If a fetch is already in flight for `key`, this waits for that fetch instead of starting a
    /// second one. Failures are returned and also broadcast to subscribers.
    pub async fn update(&self, key: K) -> FetchResult<P::Value> {
        let channel = self.start_fetch(&mut self.entries(), &key);
        channel
            .await
            .unwrap_or_else(|_canceled| Err(FetchError::Canceled))
    }

    /// Starts fetching a new value for `key` without waiting for it.
    ///
    /// Like [`update`](Self::update), this joins a fetch that is already in flight. The outcome
    /// is only observable through the cache itself and the failure stream.
    pub fn refresh(&self, key: K) {
        let _channel = self.start_fetch(&mut self.entries(), &key);
    }

    /// Invokes the producer for `key`, enforcing the configured timeout.
    ///
    /// This does not touch the cache. When the timeout elapses first, the producer's future is
    /// dropped, so its eventual outcome can never be observed.
    pub async fn fetch(&self, key: K) -> FetchResult<P::Value> {
        let computation = self.inner.producer.produce(key);

        let result = match self.inner.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, computation).await {
                Ok(result) => result,
                Err(_elapsed) => return Err(FetchError::Timeout(timeout)),
            },
            None => computation.await,
        };

        result.map_err(FetchError::producer)
    }

    /// All keys whose entries are idle and hold nothing servable.
    ///
    /// These are candidates for removal via [`clear`](Self::clear), or for a forced refresh.
    /// Each call scans the current state again.
    pub fn garbage(&self) -> std::vec::IntoIter<K> {
        self.scan(CacheEntry::is_garbage)
    }

    /// All keys whose values left their green period, without a refresh in flight.
    ///
    /// These are candidates for a proactive [`refresh`](Self::refresh). Each call scans the
    /// current state again.
    pub fn passing(&self) -> std::vec::IntoIter<K> {
        self.scan(CacheEntry::needs_refresh)
    }

    fn scan<F>(&self, predicate: F) -> std::vec::IntoIter<K>
    where
        F: Fn(&CacheEntry<K, P::Value>, Instant, &CacheConfig) -> bool,
    {
        let now = Instant::now();
        let config = &self.inner.config;
        let keys: Vec<_> = self
            .entries()
            .values()
            .filter(|entry| predicate(entry, now, config))
            .map(|entry| entry.key.clone())
            .collect();
        keys.into_iter()
    }

    /// The current freshness of `key`.
    pub fn freshness(&self, key: &K) -> Freshness {
        let now = Instant::now();
        self.entries()
            .get(key)
            .map_or(Freshness::Missing, |entry| {
                entry.freshness(now, &self.inner.config)
            })
    }

    /// The number of entries, including ones without a value.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether there are no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Returns the channel of the fetch in flight for `key`, starting one if there is none.
    ///
    /// NOTE: This function is *not* `async`, since the fetch has to be registered while the
    /// caller still holds the lock, and it has to run even if nobody awaits its result.
    fn start_fetch(&self, entries: &mut EntryMap<K, P::Value>, key: &K) -> FetchChannel<P::Value> {
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::created(key.clone(), Instant::now()));

        if let Some(pending) = &entry.pending {
            tracing::trace!(?key, id = pending.id.0, "Joining fetch in flight");
            return pending.channel.clone();
        }

        let id = FetchId(self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        entry.pending = Some(PendingFetch {
            id,
            channel: channel.clone(),
        });

        tracing::trace!(?key, id = id.0, "Spawning fetch");

        let pending_token = PendingToken {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
        };
        let this = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let result = this.fetch(key.clone()).await;
            this.complete_fetch(&key, id, &result);
            // The entry is settled before any waiter wakes up, so waiters either see the new
            // state or join a newer fetch.
            drop(pending_token);
            sender.send(result).ok();
        });

        channel
    }

    /// Applies the outcome of fetch `id` to the cache.
    ///
    /// Results of fetches that no longer own their entry are discarded.
    fn complete_fetch(&self, key: &K, id: FetchId, result: &FetchResult<P::Value>) {
        let mut entries = self.entries();
        let owns_entry = entries.get(key).and_then(CacheEntry::pending_id) == Some(id);

        match result {
            Ok(value) if owns_entry => {
                tracing::trace!(?key, id = id.0, "Fetch succeeded");
                // Replaced wholesale, which also drops the finished pending handle.
                let fresh = CacheEntry::fetched(key.clone(), value.clone(), Instant::now());
                entries.insert(key.clone(), fresh);
            }
            Ok(_) => {
                tracing::trace!(?key, id = id.0, "Discarding result of superseded fetch");
            }
            Err(error) => {
                if owns_entry {
                    if let Some(entry) = entries.get_mut(key) {
                        entry.pending = None;
                    }
                }
                drop(entries);
                self.inner.report_failure(key, error);
            }
        }
    }
}

/// Settles a fetch whose task is dropped without completing, e.g. because the producer panicked
/// or the runtime shut down.
///
/// The pending marker is cleared so the next caller starts over, and the fetch is reported as
/// [`FetchError::Canceled`]. A fetch that completed normally no longer owns its entry by the
/// time this is dropped, so it is never reported twice.
struct PendingToken<K: CacheKey, P: Producer<K>> {
    inner: Arc<Inner<K, P>>,
    key: K,
    id: FetchId,
}

impl<K: CacheKey, P: Producer<K>> Drop for PendingToken<K, P> {
    fn drop(&mut self) {
        let abandoned = {
            let mut entries = self.inner.entries();
            match entries.get_mut(&self.key) {
                Some(entry) if entry.pending_id() == Some(self.id) => {
                    entry.pending = None;
                    true
                }
                _ => false,
            }
        };

        if abandoned {
            tracing::trace!(key = ?self.key, id = self.id.0, "Fetch abandoned");
            self.inner.report_failure(&self.key, &FetchError::Canceled);
        }
    }
}
