use std::error::Error;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt};

/// The upstream resource a [`CacheControl`](crate::CacheControl) shields.
///
/// A producer computes the current value for a key. It may be slow and it may fail; the cache
/// takes care of never running more than one `produce` call per key at a time.
///
/// Any `Fn(K) -> impl Future<Output = Result<V, E>>` closure is a producer:
///
/// ```
/// use cache_control::{CacheConfig, CacheControl};
///
/// let cache = CacheControl::new(
///     |key: u32| async move { Ok::<_, std::io::Error>(key * 2) },
///     CacheConfig::default(),
/// );
/// assert_eq!(cache.get_green(&4), None);
/// ```
pub trait Producer<K>: Send + Sync + 'static {
    /// The value being cached.
    type Value: Clone + Send + Sync + 'static;
    /// The error a failed computation returns.
    type Error: Into<Box<dyn Error + Send + Sync>> + Send + 'static;

    /// Computes a fresh value for `key`.
    fn produce(&self, key: K) -> BoxFuture<'static, Result<Self::Value, Self::Error>>;
}

impl<K, F, Fut, V, E> Producer<K> for F
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Into<Box<dyn Error + Send + Sync>> + Send + 'static,
{
    type Value = V;
    type Error = E;

    fn produce(&self, key: K) -> BoxFuture<'static, Result<V, E>> {
        self(key).boxed()
    }
}
