//! Client-side query cache.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Keys results by an ordered (operation, parameter...) tuple
//! - Tracks loading/success/error status per key, keeping previous data while refetching
//! - Notifies subscribers synchronously on every write
//! - Refetches observed entries on invalidation and discards superseded fetch results
//! - Garbage-collects stale entries nobody observes

mod entry;
pub mod key;
mod observer;
mod store;

pub use entry::{CacheEntry, CacheEvent, CacheEventKind, QueryStatus};
pub use key::QueryKey;
pub use observer::{QueryObserver, Subscription};
pub use store::{CacheSettings, QueryCache, Transition, Write};
