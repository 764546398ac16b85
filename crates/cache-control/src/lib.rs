//! A stale-while-revalidate cache for values of a slow or rate-limited upstream.
//!
//! A [`CacheControl`] sits in front of an async [`Producer`]. Previously fetched values are
//! served immediately, refreshed in the background once they leave their *green* period, and
//! only waited on once they are too old to be served at all:
//!
//! ```text
//!  fetched                green_period          cache_validity
//!     |------- green -------|-------- red --------|------ expired ------>
//!       served from memory    served, refreshed      wait for a fetch
//!                             in the background
//! ```
//!
//! Concurrent requests for a key never run more than one producer call at a time. Failed
//! fetches never discard a cached value, and are broadcast to
//! [`subscribers`](CacheControl::subscribe).
//!
//! The cache has no eviction policy of its own. [`CacheControl::garbage`] and
//! [`CacheControl::passing`] enumerate entries worth removing or refreshing, which the
//! [`Sweeper`] can act upon periodically.

#![warn(missing_docs)]

mod config;
mod control;
mod entry;
mod error;
mod producer;
mod sweeper;

#[cfg(test)]
mod test;

pub use config::{CacheConfig, Config, SweeperConfig};
pub use control::{CacheControl, CacheKey};
pub use entry::{FetchResult, Freshness};
pub use error::{FetchError, FetchFailure};
pub use producer::Producer;
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
