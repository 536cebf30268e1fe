//! In-memory query cache keyed by [`QueryKey`].
//!
//! Every entry lives behind a single mutex. The lock is taken for the
//! duration of one synchronous read or write and is never held across an
//! await, so an entry is always observed either fully before or fully after
//! a write. Fetches run outside the lock and report back through
//! `finish_fetch`, which drops results belonging to a cancelled or superseded
//! generation.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RemoteError;

use super::entry::{CacheEntry, CacheEvent, CacheEventKind, QueryStatus};
use super::key::QueryKey;
use super::observer::Subscription;

type AnyValue = Arc<dyn Any + Send + Sync>;

/// A boxed future resolving to a fetch result
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send>>;

/// Type-erased fetcher stored per key so invalidation can refetch
type FetcherFn = Arc<dyn Fn() -> BoxFuture<AnyValue> + Send + Sync>;

/// Timing knobs for the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
  /// How long fetched data counts as fresh
  pub stale_time: Duration,
  /// How long an unobserved entry is kept before collection
  pub gc_time: Duration,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      stale_time: Duration::seconds(60),
      gc_time: Duration::minutes(5),
    }
  }
}

/// Outcome requested by a [`QueryCache::write_with`] closure.
#[derive(Debug, Clone, PartialEq)]
pub enum Write<T> {
  /// Replace the entry's data
  Set(T),
  /// Drop the entry's data
  Remove,
  /// Leave the entry untouched
  Skip,
}

/// Values before and after a successful [`QueryCache::write_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<T> {
  pub previous: Option<T>,
  pub current: Option<T>,
}

struct Slot {
  status: QueryStatus,
  data: Option<AnyValue>,
  error: Option<RemoteError>,
  invalidated: bool,
  updated_at: Option<DateTime<Utc>>,
  unobserved_since: Option<DateTime<Utc>>,
  /// Generation of the fetch whose result will be accepted
  in_flight: Option<u64>,
  fetcher: Option<FetcherFn>,
  subscribers: HashMap<u64, mpsc::UnboundedSender<CacheEvent>>,
}

impl Slot {
  fn new() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      invalidated: false,
      updated_at: None,
      unobserved_since: Some(Utc::now()),
      in_flight: None,
      fetcher: None,
      subscribers: HashMap::new(),
    }
  }

  fn is_stale(&self, now: DateTime<Utc>, stale_time: Duration) -> bool {
    if self.invalidated {
      return true;
    }
    match self.updated_at {
      Some(at) => now - at >= stale_time,
      None => true,
    }
  }

  fn typed<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
    let data = self.data.as_ref()?;
    let typed = (**data).downcast_ref::<T>().cloned();
    if typed.is_none() {
      warn!(
        key = %key,
        expected = std::any::type_name::<T>(),
        "Cached data has a different type than requested"
      );
    }
    typed
  }

  fn store(&mut self, value: AnyValue) {
    self.data = Some(value);
    self.status = QueryStatus::Success;
    self.error = None;
    self.invalidated = false;
    self.updated_at = Some(Utc::now());
  }

  /// Replace data without touching freshness; optimistic data is not
  /// server truth.
  fn overlay(&mut self, value: AnyValue) {
    self.data = Some(value);
    self.status = QueryStatus::Success;
    self.error = None;
  }

  fn clear(&mut self) {
    self.data = None;
    self.status = QueryStatus::Idle;
    self.error = None;
    self.updated_at = None;
  }

  fn begin_fetch(&mut self, generation: u64) {
    self.in_flight = Some(generation);
    self.status = QueryStatus::Loading;
  }

  /// Forget the in-flight fetch. Returns true if there was one.
  fn cancel_in_flight(&mut self) -> bool {
    if self.in_flight.take().is_none() {
      return false;
    }
    self.status = match (&self.data, &self.error) {
      (Some(_), _) => QueryStatus::Success,
      (None, Some(_)) => QueryStatus::Error,
      (None, None) => QueryStatus::Idle,
    };
    true
  }

  fn notify(&self, key: &QueryKey, kind: CacheEventKind) {
    for tx in self.subscribers.values() {
      // Receiver may already be gone; its Subscription unregisters on drop
      let _ = tx.send(CacheEvent {
        key: key.clone(),
        kind,
      });
    }
  }
}

struct CacheInner {
  slots: HashMap<QueryKey, Slot>,
  next_generation: u64,
  next_subscriber: u64,
}

/// Shared in-memory query cache.
///
/// Cloning is cheap; all clones see the same entries.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Mutex<CacheInner>>,
  settings: CacheSettings,
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new(CacheSettings::default())
  }
}

impl QueryCache {
  pub fn new(settings: CacheSettings) -> Self {
    Self {
      inner: Arc::new(Mutex::new(CacheInner {
        slots: HashMap::new(),
        next_generation: 0,
        next_subscriber: 0,
      })),
      settings,
    }
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.settings
  }

  fn lock(&self, op: &'static str) -> MutexGuard<'_, CacheInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        warn!(op, "Recovered from poisoned cache lock");
        poisoned.into_inner()
      }
    }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Current state of `key`, with its data cloned out of the store.
  pub fn get<T: Clone + 'static>(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    let inner = self.lock("get");
    let slot = inner.slots.get(key)?;

    Some(CacheEntry {
      key: key.clone(),
      status: slot.status,
      data: slot.typed::<T>(key),
      error: slot.error.clone(),
      subscriber_count: slot.subscribers.len(),
      is_stale: slot.is_stale(Utc::now(), self.settings.stale_time),
      updated_at: slot.updated_at,
    })
  }

  pub fn get_data<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
    self.get(key).and_then(|entry| entry.data)
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.lock("contains").slots.contains_key(key)
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self
      .lock("subscriber_count")
      .slots
      .get(key)
      .map(|slot| slot.subscribers.len())
      .unwrap_or(0)
  }

  /// All keys currently held, in key order.
  pub fn keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.lock("keys").slots.keys().cloned().collect();
    keys.sort();
    keys
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Replace the data under `key` and mark it successful.
  pub fn set<T: Send + Sync + 'static>(&self, key: &QueryKey, data: T) {
    let mut inner = self.lock("set");
    let slot = inner.slots.entry(key.clone()).or_insert_with(Slot::new);
    slot.store(Arc::new(data));
    slot.notify(key, CacheEventKind::Updated);
  }

  /// Atomic read-modify-write of the data under `key`.
  ///
  /// `f` sees a copy of the current data (or `None` when absent) and decides
  /// what to write. Returns `None` when `f` skipped the write.
  pub fn write_with<T, F>(&self, key: &QueryKey, f: F) -> Option<Transition<T>>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(Option<&T>) -> Write<T>,
  {
    self.write_locked("write_with", key, f, false)
  }

  /// Optimistic read-modify-write of the data under `key`.
  ///
  /// Same contract as [`write_with`](Self::write_with), except that a write
  /// cancels the in-flight fetch for `key` under the same lock and leaves
  /// the entry's freshness as it was. A skipped write touches nothing.
  pub fn overlay_with<T, F>(&self, key: &QueryKey, f: F) -> Option<Transition<T>>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(Option<&T>) -> Write<T>,
  {
    self.write_locked("overlay_with", key, f, true)
  }

  fn write_locked<T, F>(
    &self,
    op: &'static str,
    key: &QueryKey,
    f: F,
    overlay: bool,
  ) -> Option<Transition<T>>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(Option<&T>) -> Write<T>,
  {
    let mut inner = self.lock(op);
    let previous = inner.slots.get(key).and_then(|slot| slot.typed::<T>(key));

    match f(previous.as_ref()) {
      Write::Skip => None,
      Write::Set(value) => {
        let current = value.clone();
        let slot = inner.slots.entry(key.clone()).or_insert_with(Slot::new);
        if overlay {
          if slot.cancel_in_flight() {
            debug!(key = %key, "Cancelled in-flight fetch under optimistic write");
          }
          slot.overlay(Arc::new(value));
        } else {
          slot.store(Arc::new(value));
        }
        slot.notify(key, CacheEventKind::Updated);
        Some(Transition {
          previous,
          current: Some(current),
        })
      }
      Write::Remove => {
        Self::remove_locked(&mut inner, key);
        Some(Transition {
          previous,
          current: None,
        })
      }
    }
  }

  /// Drop the data under `key`. Observed entries keep their subscribers and
  /// fall back to `Idle`.
  pub fn remove(&self, key: &QueryKey) -> bool {
    let mut inner = self.lock("remove");
    Self::remove_locked(&mut inner, key)
  }

  fn remove_locked(inner: &mut CacheInner, key: &QueryKey) -> bool {
    let Some(slot) = inner.slots.get_mut(key) else {
      return false;
    };

    slot.cancel_in_flight();
    slot.notify(key, CacheEventKind::Removed);
    if slot.subscribers.is_empty() {
      inner.slots.remove(key);
    } else {
      slot.clear();
    }
    true
  }

  // ==========================================================================
  // Invalidation and cancellation
  // ==========================================================================

  /// Mark `key` stale, cancel any superseded fetch, and refetch when the
  /// entry has subscribers. Returns true if a refetch was scheduled.
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    let refetch = {
      let mut guard = self.lock("invalidate");
      let inner = &mut *guard;
      let Some(slot) = inner.slots.get_mut(key) else {
        return false;
      };

      slot.invalidated = true;
      if slot.cancel_in_flight() {
        debug!(key = %key, "Cancelled superseded fetch on invalidation");
      }
      slot.notify(key, CacheEventKind::Invalidated);

      let fetcher = if slot.subscribers.is_empty() {
        None
      } else {
        slot.fetcher.clone()
      };
      match fetcher {
        Some(fetcher) => {
          inner.next_generation += 1;
          let generation = inner.next_generation;
          slot.begin_fetch(generation);
          slot.notify(key, CacheEventKind::Loading);
          Some((generation, fetcher))
        }
        None => None,
      }
    };

    debug!(key = %key, refetch = refetch.is_some(), "Invalidated query");

    match refetch {
      Some((generation, fetcher)) => {
        self.spawn_fetch(key.clone(), generation, fetcher);
        true
      }
      None => false,
    }
  }

  /// Invalidate every key that starts with `prefix`. Returns the number of
  /// entries invalidated.
  pub fn invalidate_matching(&self, prefix: &QueryKey) -> usize {
    let keys: Vec<QueryKey> = self
      .lock("invalidate_matching")
      .slots
      .keys()
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect();

    for key in &keys {
      self.invalidate(key);
    }
    keys.len()
  }

  /// Make any in-flight fetch for `key` discard its result on arrival.
  pub fn cancel(&self, key: &QueryKey) -> bool {
    let mut inner = self.lock("cancel");
    let cancelled = inner
      .slots
      .get_mut(key)
      .map(Slot::cancel_in_flight)
      .unwrap_or(false);

    if cancelled {
      debug!(key = %key, "Cancelled in-flight fetch");
    }
    cancelled
  }

  // ==========================================================================
  // Fetching
  // ==========================================================================

  /// Register the fetcher used to refetch `key` after invalidation.
  pub fn set_fetcher<T, F, Fut>(&self, key: &QueryKey, fetcher: F)
  where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    let erased = erase(Arc::new(fetcher));
    let mut inner = self.lock("set_fetcher");
    inner
      .slots
      .entry(key.clone())
      .or_insert_with(Slot::new)
      .fetcher = Some(erased);
  }

  /// Fetch `key` now, store the result, and return it.
  ///
  /// A newer fetch, a cancel or an invalidation issued while this one is in
  /// flight makes the store ignore this result; the caller still receives it.
  pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T, RemoteError>
  where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    let fetcher = Arc::new(fetcher);
    self.install(key, &fetcher);
    self.run_fetch(key, &fetcher).await
  }

  /// Return fresh cached data for `key`, fetching only when the entry is
  /// missing or stale.
  pub async fn fetch_query<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T, RemoteError>
  where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    let fetcher = Arc::new(fetcher);
    self.install(key, &fetcher);

    if let Some(entry) = self.get::<T>(key) {
      if !entry.is_stale {
        if let Some(data) = entry.data {
          debug!(key = %key, "Serving fresh cached data");
          return Ok(data);
        }
      }
    }

    self.run_fetch(key, &fetcher).await
  }

  /// Refetch `key` in the background using its registered fetcher.
  pub fn refetch(&self, key: &QueryKey) -> bool {
    let started = {
      let mut guard = self.lock("refetch");
      let inner = &mut *guard;
      let Some(slot) = inner.slots.get_mut(key) else {
        return false;
      };
      let Some(fetcher) = slot.fetcher.clone() else {
        return false;
      };

      inner.next_generation += 1;
      let generation = inner.next_generation;
      slot.begin_fetch(generation);
      slot.notify(key, CacheEventKind::Loading);
      (generation, fetcher)
    };

    self.spawn_fetch(key.clone(), started.0, started.1);
    true
  }

  /// Refetch `key` if it is stale and nothing is already loading it.
  pub fn ensure_fresh(&self, key: &QueryKey) -> bool {
    let needs_fetch = {
      let inner = self.lock("ensure_fresh");
      inner.slots.get(key).is_some_and(|slot| {
        slot.in_flight.is_none() && slot.is_stale(Utc::now(), self.settings.stale_time)
      })
    };

    needs_fetch && self.refetch(key)
  }

  fn install<T, F, Fut>(&self, key: &QueryKey, fetcher: &Arc<F>)
  where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    let erased = erase(Arc::clone(fetcher));
    let mut inner = self.lock("install");
    inner
      .slots
      .entry(key.clone())
      .or_insert_with(Slot::new)
      .fetcher = Some(erased);
  }

  async fn run_fetch<T, F, Fut>(&self, key: &QueryKey, fetcher: &Arc<F>) -> Result<T, RemoteError>
  where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    let generation = {
      let mut guard = self.lock("fetch");
      let inner = &mut *guard;
      inner.next_generation += 1;
      let generation = inner.next_generation;
      let slot = inner.slots.entry(key.clone()).or_insert_with(Slot::new);
      slot.begin_fetch(generation);
      slot.notify(key, CacheEventKind::Loading);
      generation
    };

    debug!(key = %key, generation, "Fetching query");
    let result = fetcher().await;

    let erased = match &result {
      Ok(value) => Ok(Arc::new(value.clone()) as AnyValue),
      Err(err) => Err(err.clone()),
    };
    self.finish_fetch(key, generation, erased);

    result
  }

  fn spawn_fetch(&self, key: QueryKey, generation: u64, fetcher: FetcherFn) {
    let handle = match tokio::runtime::Handle::try_current() {
      Ok(handle) => handle,
      Err(_) => {
        warn!(key = %key, "No async runtime available, refetch skipped");
        self.abandon_fetch(&key, generation);
        return;
      }
    };

    let cache = self.clone();
    handle.spawn(async move {
      let result = fetcher().await;
      cache.finish_fetch(&key, generation, result);
    });
  }

  fn abandon_fetch(&self, key: &QueryKey, generation: u64) {
    let mut inner = self.lock("abandon_fetch");
    if let Some(slot) = inner.slots.get_mut(key) {
      if slot.in_flight == Some(generation) {
        slot.cancel_in_flight();
      }
    }
  }

  /// Store a fetch result if its generation is still the accepted one.
  fn finish_fetch(&self, key: &QueryKey, generation: u64, result: Result<AnyValue, RemoteError>) -> bool {
    let mut inner = self.lock("finish_fetch");
    let Some(slot) = inner.slots.get_mut(key) else {
      debug!(key = %key, generation, "Discarded fetch result for removed entry");
      return false;
    };

    if slot.in_flight != Some(generation) {
      debug!(key = %key, generation, "Discarded superseded fetch result");
      return false;
    }
    slot.in_flight = None;

    match result {
      Ok(value) => {
        slot.store(value);
        slot.notify(key, CacheEventKind::Updated);
        debug!(key = %key, generation, "Fetch succeeded");
      }
      Err(err) => {
        warn!(key = %key, generation, error = %err, "Fetch failed");
        slot.status = QueryStatus::Error;
        slot.error = Some(err);
        slot.notify(key, CacheEventKind::Failed);
      }
    }
    true
  }

  // ==========================================================================
  // Subscriptions and garbage collection
  // ==========================================================================

  /// Subscribe to events for `key`, creating an idle entry if needed.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = {
      let mut guard = self.lock("subscribe");
      let inner = &mut *guard;
      let id = inner.next_subscriber;
      inner.next_subscriber += 1;

      let slot = inner.slots.entry(key.clone()).or_insert_with(Slot::new);
      slot.subscribers.insert(id, tx);
      slot.unobserved_since = None;
      id
    };

    Subscription::new(self.clone(), key.clone(), id, rx)
  }

  pub(crate) fn unsubscribe(&self, key: &QueryKey, id: u64) {
    let mut inner = self.lock("unsubscribe");
    let now = Utc::now();

    let collect = match inner.slots.get_mut(key) {
      Some(slot) => {
        slot.subscribers.remove(&id);
        if slot.subscribers.is_empty() {
          slot.unobserved_since = Some(now);
          slot.in_flight.is_none() && slot.is_stale(now, self.settings.stale_time)
        } else {
          false
        }
      }
      None => false,
    };

    if collect {
      inner.slots.remove(key);
      debug!(key = %key, "Collected stale entry after last subscriber left");
    }
  }

  /// Remove entries nobody observes that are stale or have been unobserved
  /// for longer than the gc time. Returns the number removed.
  pub fn collect_garbage(&self) -> usize {
    let now = Utc::now();
    let settings = self.settings;
    let mut inner = self.lock("collect_garbage");
    let before = inner.slots.len();

    inner.slots.retain(|key, slot| {
      if !slot.subscribers.is_empty() || slot.in_flight.is_some() {
        return true;
      }
      let expired = slot
        .unobserved_since
        .is_some_and(|since| now - since >= settings.gc_time);
      let keep = !(expired || slot.is_stale(now, settings.stale_time));
      if !keep {
        debug!(key = %key, "Garbage collected entry");
      }
      keep
    });

    before - inner.slots.len()
  }
}

fn erase<T, F, Fut>(fetcher: Arc<F>) -> FetcherFn
where
  T: Send + Sync + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
{
  Arc::new(move || -> BoxFuture<AnyValue> {
    let fut = fetcher();
    Box::pin(async move { fut.await.map(|value| Arc::new(value) as AnyValue) })
  })
}
