//! Subscriptions and query observers.
//!
//! A [`QueryObserver`] is what a view holds on to: it keeps its key
//! subscribed (so invalidation refetches it), starts the initial fetch, and
//! exposes the entry's status and data.
//!
//! # Example
//!
//! ```ignore
//! let remote = remote.clone();
//! let post_id = "p1".to_string();
//! let mut comments = QueryObserver::new(
//!     cache.clone(),
//!     QueryKey::comments(&post_id),
//!     move || {
//!         let remote = remote.clone();
//!         let post_id = post_id.clone();
//!         async move { remote.get_comments(&post_id).await }
//!     },
//!     true,
//! );
//!
//! // In event loop tick
//! if comments.poll() {
//!     // Entry changed, trigger re-render
//! }
//!
//! // In render
//! match comments.status() {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render_list(comments.data()),
//!     QueryStatus::Error => render_error(comments.error()),
//!     QueryStatus::Idle => {}
//! }
//! ```

use std::future::Future;
use std::marker::PhantomData;

use tokio::sync::mpsc;

use crate::error::RemoteError;

use super::entry::{CacheEntry, CacheEvent, QueryStatus};
use super::key::QueryKey;
use super::store::QueryCache;

/// Live registration for one key's events. Unsubscribes on drop.
pub struct Subscription {
  cache: QueryCache,
  key: QueryKey,
  id: u64,
  events: mpsc::UnboundedReceiver<CacheEvent>,
}

impl Subscription {
  pub(crate) fn new(
    cache: QueryCache,
    key: QueryKey,
    id: u64,
    events: mpsc::UnboundedReceiver<CacheEvent>,
  ) -> Self {
    Self {
      cache,
      key,
      id,
      events,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Next queued event, without waiting.
  pub fn try_next(&mut self) -> Option<CacheEvent> {
    self.events.try_recv().ok()
  }

  /// Wait for the next event.
  pub async fn next(&mut self) -> Option<CacheEvent> {
    self.events.recv().await
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cache.unsubscribe(&self.key, self.id);
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

/// A subscribed view of one cached query.
pub struct QueryObserver<T> {
  cache: QueryCache,
  subscription: Subscription,
  enabled: bool,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> QueryObserver<T> {
  /// Observe `key`, registering `fetcher` for it.
  ///
  /// When `enabled` is false the observer is registered but never fetches;
  /// its status stays `Idle` until data is written by someone else.
  pub fn new<F, Fut>(cache: QueryCache, key: QueryKey, fetcher: F, enabled: bool) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    cache.set_fetcher(&key, fetcher);
    let subscription = cache.subscribe(&key);
    if enabled {
      cache.ensure_fresh(&key);
    }

    Self {
      cache,
      subscription,
      enabled,
      _marker: PhantomData,
    }
  }

  pub fn key(&self) -> &QueryKey {
    self.subscription.key()
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  /// Current entry. A disabled or never-fetched query reads as `Idle`.
  pub fn entry(&self) -> CacheEntry<T> {
    self.cache.get(self.key()).unwrap_or_else(|| CacheEntry {
      key: self.key().clone(),
      status: QueryStatus::Idle,
      data: None,
      error: None,
      subscriber_count: 0,
      is_stale: true,
      updated_at: None,
    })
  }

  pub fn status(&self) -> QueryStatus {
    self.entry().status
  }

  pub fn data(&self) -> Option<T> {
    self.entry().data
  }

  pub fn error(&self) -> Option<RemoteError> {
    self.entry().error
  }

  pub fn is_loading(&self) -> bool {
    self.status() == QueryStatus::Loading
  }

  /// Drain pending events. Returns `true` if anything changed since the
  /// last poll. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while self.subscription.try_next().is_some() {
      changed = true;
    }
    changed
  }

  /// Wait until the entry changes.
  pub async fn changed(&mut self) -> Option<CacheEvent> {
    self.subscription.next().await
  }

  /// Force a background refetch. No-op for disabled observers.
  pub fn refetch(&self) -> bool {
    self.enabled && self.cache.refetch(self.key())
  }
}

impl<T> std::fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", self.subscription.key())
      .field("enabled", &self.enabled)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::entry::CacheEventKind;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test]
  async fn test_observer_fetches_on_creation() {
    let cache = QueryCache::default();
    let mut observer = QueryObserver::new(
      cache.clone(),
      QueryKey::recent_posts(),
      || async { Ok::<_, RemoteError>(vec![1, 2, 3]) },
      true,
    );

    assert!(observer.is_loading());

    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(observer.poll());
    assert_eq!(observer.status(), QueryStatus::Success);
    assert_eq!(observer.data(), Some(vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_disabled_observer_stays_idle() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let observer = QueryObserver::new(
      cache.clone(),
      QueryKey::search_posts(""),
      move || {
        let counter = counter_clone.clone();
        async move { Ok::<_, RemoteError>(counter.fetch_add(1, Ordering::SeqCst)) }
      },
      false,
    );

    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(observer.status(), QueryStatus::Idle);
    assert!(!observer.refetch());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_observer_error_state() {
    let cache = QueryCache::default();
    let observer: QueryObserver<u32> = QueryObserver::new(
      cache.clone(),
      QueryKey::current_user(),
      || async { Err(RemoteError::Transport("Something went wrong".to_string())) },
      true,
    );

    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(observer.status(), QueryStatus::Error);
    assert_eq!(
      observer.error(),
      Some(RemoteError::Transport("Something went wrong".to_string()))
    );
  }

  #[tokio::test]
  async fn test_observer_sees_invalidation_refetch() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let mut observer = QueryObserver::new(
      cache.clone(),
      QueryKey::comments("p1"),
      move || {
        let counter = counter_clone.clone();
        async move { Ok::<_, RemoteError>(counter.fetch_add(1, Ordering::SeqCst)) }
      },
      true,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    observer.poll();
    assert_eq!(observer.data(), Some(0));

    assert!(cache.invalidate(observer.key()));
    let event = observer.changed().await.unwrap();
    assert_eq!(event.kind, CacheEventKind::Invalidated);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(observer.data(), Some(1));
  }

  #[tokio::test]
  async fn test_observers_share_one_entry() {
    let cache = QueryCache::default();
    let first = QueryObserver::new(
      cache.clone(),
      QueryKey::users(),
      || async { Ok::<_, RemoteError>(7u32) },
      true,
    );
    let second = QueryObserver::new(
      cache.clone(),
      QueryKey::users(),
      || async { Ok::<_, RemoteError>(7u32) },
      true,
    );

    assert_eq!(cache.subscriber_count(first.key()), 2);
    drop(second);
    assert_eq!(cache.subscriber_count(first.key()), 1);
  }
}
