use std::fmt;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::Shared;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::error::FetchError;

/// The outcome of a single fetch.
pub type FetchResult<V> = Result<V, FetchError>;

/// A shareable handle to the result of an in-flight fetch.
pub(crate) type FetchChannel<V> = Shared<oneshot::Receiver<FetchResult<V>>>;

/// Identifies one fetch, so that a result can tell whether it still owns the entry it was
/// started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchId(pub u64);

/// A fetch that is currently running for an entry.
pub(crate) struct PendingFetch<V> {
    pub id: FetchId,
    pub channel: FetchChannel<V>,
}

impl<V> fmt::Debug for PendingFetch<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingFetch").field("id", &self.id).finish()
    }
}

/// The freshness of a key, as reported by [`CacheControl::freshness`](crate::CacheControl::freshness).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// There is no entry for this key.
    Missing,
    /// The entry has no value and no fetch in flight.
    Empty,
    /// The entry has no value yet, but a fetch is in flight.
    Fetching,
    /// The value is within its green period.
    Fresh,
    /// The value left its green period but is still servable.
    Stale,
    /// The value is past its validity and will not be served anymore.
    Expired,
}

/// The state kept per key.
#[derive(Debug)]
pub(crate) struct CacheEntry<K, V> {
    pub key: K,
    /// When the last fetch succeeded, or when the entry was created.
    pub time: Instant,
    pub value: Option<V>,
    pub pending: Option<PendingFetch<V>>,
}

impl<K, V> CacheEntry<K, V> {
    /// A fresh entry created for a first-ever fetch.
    pub fn created(key: K, now: Instant) -> Self {
        Self {
            key,
            time: now,
            value: None,
            pending: None,
        }
    }

    /// The record that wholesale replaces an entry after a successful fetch.
    pub fn fetched(key: K, value: V, now: Instant) -> Self {
        Self {
            key,
            time: now,
            value: Some(value),
            pending: None,
        }
    }

    /// Whether `now` is still before `time + period`.
    ///
    /// A period too large to be represented never elapses.
    fn within(&self, now: Instant, period: Duration) -> bool {
        self.time
            .checked_add(period)
            .is_none_or(|deadline| now < deadline)
    }

    pub fn pending_id(&self) -> Option<FetchId> {
        self.pending.as_ref().map(|pending| pending.id)
    }

    /// The value, if it is within its green period.
    pub fn green_value(&self, now: Instant, config: &CacheConfig) -> Option<&V> {
        self.value
            .as_ref()
            .filter(|_| self.within(now, config.green_period))
    }

    /// The value, if it is still servable, either green or red.
    pub fn valid_value(&self, now: Instant, config: &CacheConfig) -> Option<&V> {
        self.value
            .as_ref()
            .filter(|_| self.within(now, config.cache_validity()))
    }

    /// Whether no value has been recorded.
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Whether the value left its green period and nothing is refreshing it yet.
    pub fn needs_refresh(&self, now: Instant, config: &CacheConfig) -> bool {
        self.value.is_some()
            && self.pending.is_none()
            && !self.within(now, config.green_period)
    }

    /// Whether the entry is idle and has nothing servable, making it a candidate for removal.
    pub fn is_garbage(&self, now: Instant, config: &CacheConfig) -> bool {
        self.pending.is_none() && self.valid_value(now, config).is_none()
    }

    pub fn freshness(&self, now: Instant, config: &CacheConfig) -> Freshness {
        match (&self.value, &self.pending) {
            (None, None) => Freshness::Empty,
            (None, Some(_)) => Freshness::Fetching,
            (Some(_), _) if self.within(now, config.green_period) => Freshness::Fresh,
            (Some(_), _) if self.within(now, config.cache_validity()) => Freshness::Stale,
            (Some(_), _) => Freshness::Expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            green_period: Duration::from_millis(100),
            red_period: Duration::from_millis(100),
            timeout: None,
        }
    }

    fn pending<V: Clone>(id: u64) -> PendingFetch<V> {
        let (_sender, receiver) = oneshot::channel();
        PendingFetch {
            id: FetchId(id),
            channel: futures::FutureExt::shared(receiver),
        }
    }

    #[test]
    fn test_windows() {
        let config = config();
        let start = Instant::now();
        let entry = CacheEntry::fetched("x", 1, start);

        assert_eq!(entry.green_value(start, &config), Some(&1));
        assert_eq!(entry.freshness(start, &config), Freshness::Fresh);
        assert!(!entry.needs_refresh(start, &config));
        assert!(!entry.is_garbage(start, &config));

        let red = start + Duration::from_millis(100);
        assert_eq!(entry.green_value(red, &config), None);
        assert_eq!(entry.valid_value(red, &config), Some(&1));
        assert_eq!(entry.freshness(red, &config), Freshness::Stale);
        assert!(entry.needs_refresh(red, &config));
        assert!(!entry.is_garbage(red, &config));

        let expired = start + Duration::from_millis(200);
        assert_eq!(entry.valid_value(expired, &config), None);
        assert_eq!(entry.freshness(expired, &config), Freshness::Expired);
        assert!(entry.needs_refresh(expired, &config));
        assert!(entry.is_garbage(expired, &config));
    }

    #[test]
    fn test_falsy_values_are_present() {
        let config = config();
        let now = Instant::now();

        let entry = CacheEntry::fetched(0, false, now);
        assert_eq!(entry.green_value(now, &config), Some(&false));
        assert!(!entry.is_empty());

        let entry = CacheEntry::fetched(0, Vec::<u8>::new(), now);
        assert_eq!(entry.valid_value(now, &config), Some(&vec![]));
    }

    #[test]
    fn test_pending_entries() {
        let config = config();
        let start = Instant::now();
        let later = start + Duration::from_secs(1);

        let mut entry = CacheEntry::<_, u32>::created("x", start);
        assert!(entry.is_empty());
        assert_eq!(entry.freshness(start, &config), Freshness::Empty);
        assert!(entry.is_garbage(start, &config));

        entry.pending = Some(pending(1));
        assert_eq!(entry.pending_id(), Some(FetchId(1)));
        assert_eq!(entry.freshness(later, &config), Freshness::Fetching);
        assert!(!entry.is_garbage(later, &config));

        // revalidating entries are neither garbage nor in need of another refresh
        entry.value = Some(7);
        assert!(!entry.needs_refresh(later, &config));
        assert!(!entry.is_garbage(later, &config));
        assert_eq!(entry.freshness(later, &config), Freshness::Expired);
    }

    #[test]
    fn test_unbounded_period() {
        let config = CacheConfig {
            green_period: Duration::MAX,
            ..config()
        };
        let now = Instant::now();
        let entry = CacheEntry::fetched("x", 1, now);
        assert_eq!(entry.green_value(now + Duration::from_secs(3600), &config), Some(&1));
    }
}
