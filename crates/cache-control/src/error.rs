use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while fetching a value from the producer.
///
/// The error is shared between every caller waiting on the same fetch, which is why it is
/// [`Clone`] and wraps producer errors in an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The producer itself failed.
    #[error("producer failed: {0}")]
    Producer(Arc<dyn Error + Send + Sync>),
    /// The producer did not settle within the configured timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch was dropped before it could report a result, for example because the runtime
    /// shut down.
    #[error("fetch canceled")]
    Canceled,
}

impl FetchError {
    /// Wraps any error a producer might return.
    pub fn producer<E>(err: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let err: Box<dyn Error + Send + Sync> = err.into();
        Self::Producer(Arc::from(err))
    }

    /// Whether this error is a [`Timeout`](Self::Timeout).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// A failed fetch, as broadcast on [`CacheControl::subscribe`](crate::CacheControl::subscribe).
#[derive(Debug, Clone)]
pub struct FetchFailure<K> {
    /// The key whose fetch failed.
    pub key: K,
    /// The reason the fetch failed.
    pub error: FetchError,
}
