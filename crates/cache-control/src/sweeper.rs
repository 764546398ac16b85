//! Periodic maintenance of a [`CacheControl`].
//!
//! The cache itself never evicts anything. A [`Sweeper`] uses [`CacheControl::garbage`] and
//! [`CacheControl::passing`] to remove entries which are no longer servable, and to refresh
//! entries before callers would have to wait on them.

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, SweeperConfig};
use crate::control::{CacheControl, CacheKey};
use crate::producer::Producer;

/// The outcome of a single [`Sweeper::sweep_once`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Number of garbage entries removed.
    pub evicted: usize,
    /// Number of refreshes started for passing entries.
    pub refreshed: usize,
}

/// Evicts garbage and pre-warms passing entries of a [`CacheControl`].
pub struct Sweeper<K: CacheKey, P: Producer<K>> {
    cache: CacheControl<K, P>,
    config: SweeperConfig,
}

impl<K: CacheKey, P: Producer<K>> Clone for Sweeper<K, P> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            config: self.config,
        }
    }
}

impl<K: CacheKey, P: Producer<K>> fmt::Debug for Sweeper<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sweeper")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl<K: CacheKey, P: Producer<K>> Sweeper<K, P> {
    /// Creates a sweeper for `cache`.
    pub fn new(cache: CacheControl<K, P>, config: SweeperConfig) -> Self {
        Self { cache, config }
    }

    /// Creates a sweeper for `cache` from the `sweeper` section of `config`, if there is one.
    pub fn from_config(cache: CacheControl<K, P>, config: &Config) -> Option<Self> {
        let sweeper = config.sweeper?;
        Some(Self::new(cache, sweeper))
    }

    /// Performs a single pass over the cache.
    ///
    /// Refreshes are only started here, their outcome is reported through the cache as usual.
    pub fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        if self.config.evict_garbage {
            for key in self.cache.garbage() {
                // a fetch may have settled the entry since the scan
                if self.cache.remove_if_garbage(&key) {
                    report.evicted += 1;
                }
            }
        }

        if self.config.refresh_passing {
            for key in self.cache.passing() {
                self.cache.refresh(key);
                report.refreshed += 1;
            }
        }

        tracing::debug!(
            evicted = report.evicted,
            refreshed = report.refreshed,
            "Swept cache"
        );
        report
    }

    /// Spawns a task sweeping the cache every `interval`, until the returned handle is shut
    /// down or dropped.
    ///
    /// The first sweep happens one `interval` after spawning.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        // `interval` panics on a zero period
        let period = self.config.interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first tick (immediate)
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep_once();
                    }
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Sweeper shutting down");
                        break;
                    }
                }
            }
        });

        SweeperHandle { shutdown_tx, task }
    }
}

/// Controls a sweeper spawned with [`Sweeper::spawn`].
///
/// Dropping the handle stops the sweeper as well.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweeper and waits for its task to finish.
    pub async fn shutdown(self) {
        self.shutdown_tx.send(()).ok();
        self.task.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use tokio::time;

    use crate::CacheConfig;
    use crate::test;

    use super::*;

    fn cache() -> CacheControl<&'static str, impl Producer<&'static str, Value = &'static str>> {
        CacheControl::new(
            |key: &'static str| async move { Ok::<_, Infallible>(key) },
            CacheConfig {
                green_period: Duration::from_millis(100),
                red_period: Duration::from_millis(100),
                timeout: None,
            },
        )
    }

    #[tokio::test]
    async fn test_sweep_once() {
        test::setup();
        time::pause();

        let cache = cache();
        cache.get("a").await.unwrap();
        time::sleep(Duration::from_millis(150)).await;
        cache.get("b").await.unwrap();

        let sweeper = Sweeper::new(
            cache.clone(),
            SweeperConfig {
                interval: Duration::from_secs(1),
                evict_garbage: true,
                refresh_passing: true,
            },
        );

        // `a` is passing, `b` is fresh
        let report = sweeper.sweep_once();
        assert_eq!(
            report,
            SweepReport {
                evicted: 0,
                refreshed: 1
            }
        );
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get_green(&"a"), Some("a"));

        time::sleep(Duration::from_millis(300)).await;
        let report = sweeper.sweep_once();
        assert_eq!(
            report,
            SweepReport {
                evicted: 2,
                refreshed: 0
            }
        );
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_disabled() {
        test::setup();
        time::pause();

        let cache = cache();
        cache.get("a").await.unwrap();
        time::sleep(Duration::from_millis(300)).await;

        let sweeper = Sweeper::new(
            cache.clone(),
            SweeperConfig {
                interval: Duration::from_secs(1),
                evict_garbage: false,
                refresh_passing: false,
            },
        );
        assert_eq!(sweeper.sweep_once(), SweepReport::default());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_from_config() {
        test::setup();

        let config = Config::default();
        assert!(Sweeper::from_config(cache(), &config).is_none());

        let config = Config {
            sweeper: Some(SweeperConfig {
                refresh_passing: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let sweeper = Sweeper::from_config(cache(), &config).unwrap();
        assert!(sweeper.config.refresh_passing);
        assert_eq!(sweeper.config.interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_spawned_sweeper() {
        test::setup();
        time::pause();

        let cache = cache();
        cache.get("a").await.unwrap();

        let handle = Sweeper::new(
            cache.clone(),
            SweeperConfig {
                interval: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .spawn();

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.len(), 1);

        time::sleep(Duration::from_millis(200)).await;
        assert!(cache.is_empty());

        handle.shutdown().await;
    }
}
