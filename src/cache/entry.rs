//! Cache entry view types.

use chrono::{DateTime, Utc};

use crate::error::RemoteError;

use super::key::QueryKey;

/// Lifecycle status of a cached query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
  /// Query has not been started (or is disabled)
  #[default]
  Idle,
  /// A fetch is in flight; previous data, if any, is still readable
  Loading,
  /// Last fetch or write succeeded
  Success,
  /// Last fetch failed
  Error,
}

/// Snapshot of one cache entry, as handed out by [`super::QueryCache::get`].
///
/// `data` is a clone of the cached value, never a reference into the store.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: QueryKey,
  pub status: QueryStatus,
  pub data: Option<T>,
  pub error: Option<RemoteError>,
  pub subscriber_count: usize,
  /// Invalidated, or older than the store's stale time
  pub is_stale: bool,
  pub updated_at: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&RemoteError> {
    self.error.as_ref()
  }
}

/// What happened to an entry, delivered to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
  Loading,
  Updated,
  Failed,
  Invalidated,
  Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
  pub key: QueryKey,
  pub kind: CacheEventKind,
}
