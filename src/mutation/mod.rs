//! Optimistic mutation protocol.
//!
//! A [`MutationRun`] drives one write against the cache:
//!
//! ```text
//! Idle -> Applying -> AwaitingRemote -> Committed
//!                                    -> RolledBack
//! ```
//!
//! `apply` snapshots the entry by value and writes the optimistic projection
//! in one atomic cache write. Optimistic writes never make an entry fresh;
//! the caller invalidates once the remote has answered. The caller then awaits the remote and either
//! commits or rolls back. Rollback restores the snapshot exactly when the
//! entry still holds the optimistic value; if something else wrote to the
//! entry in the meantime only this mutation's own effect is undone.

mod comments;
mod lanes;

use tracing::{debug, warn};

use crate::cache::{QueryCache, QueryKey, Write};
use crate::error::MutationError;

pub use comments::{CommentMutations, LikeToggle, NewComment};
pub use lanes::MutationLanes;

/// Lifecycle of a single optimistic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Idle,
  Applying,
  AwaitingRemote,
  Committed,
  RolledBack,
}

/// Status of the latest mutation of a kind, as shown to the view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MutationStatus {
  #[default]
  Idle,
  Pending,
  Success,
  Error(MutationError),
}

impl MutationStatus {
  pub fn is_pending(&self) -> bool {
    matches!(self, Self::Pending)
  }
}

/// Prior value of a cache entry, owned by the mutation until it settles.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
  pub key: QueryKey,
  /// `None` when the entry had no data at apply time
  pub value: Option<T>,
}

/// How a rollback left the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
  /// Entry still held the optimistic value; snapshot restored exactly
  Restored,
  /// Entry changed since apply; only this mutation's effect was undone
  Reverted,
  /// Entry no longer exists; nothing to do
  Evicted,
  /// Nothing was applied
  NotApplied,
}

/// An optimistic projection over one cache entry.
pub trait OptimisticUpdate {
  type Data: Clone + PartialEq + Send + Sync + 'static;

  fn key(&self) -> &QueryKey;

  /// Optimistic value computed from the current data. `None` aborts the
  /// mutation without touching the cache.
  fn apply(&self, current: Option<&Self::Data>) -> Option<Self::Data>;

  /// Undo this update's effect on data that has diverged from the
  /// optimistic value.
  fn revert(&self, current: &Self::Data, snapshot: Option<&Self::Data>) -> Self::Data;
}

/// One optimistic write in flight.
///
/// Dropping a run that is still awaiting the remote rolls it back, so an
/// abandoned mutation never leaves its overlay in the cache.
pub struct MutationRun<U: OptimisticUpdate> {
  cache: QueryCache,
  update: U,
  phase: MutationPhase,
  snapshot: Option<Snapshot<U::Data>>,
  optimistic: Option<U::Data>,
}

impl<U: OptimisticUpdate> MutationRun<U> {
  pub fn new(cache: QueryCache, update: U) -> Self {
    Self {
      cache,
      update,
      phase: MutationPhase::Idle,
      snapshot: None,
      optimistic: None,
    }
  }

  pub fn phase(&self) -> MutationPhase {
    self.phase
  }

  pub fn update(&self) -> &U {
    &self.update
  }

  pub fn snapshot(&self) -> Option<&Snapshot<U::Data>> {
    self.snapshot.as_ref()
  }

  /// Snapshot the entry and write the optimistic value. Returns false when
  /// the update aborted, leaving the cache untouched.
  pub fn apply(&mut self) -> bool {
    if self.phase != MutationPhase::Idle {
      warn!(phase = ?self.phase, "Mutation applied twice");
      return false;
    }
    self.phase = MutationPhase::Applying;

    let key = self.update.key().clone();
    let update = &self.update;
    // The write also cancels a fetch that would overwrite it on arrival
    let transition = self.cache.overlay_with::<U::Data, _>(&key, |current| {
      match update.apply(current) {
        Some(next) => Write::Set(next),
        None => Write::Skip,
      }
    });

    match transition {
      Some(transition) => {
        debug!(key = %key, "Applied optimistic update");
        self.snapshot = Some(Snapshot {
          key,
          value: transition.previous,
        });
        self.optimistic = transition.current;
        self.phase = MutationPhase::AwaitingRemote;
        true
      }
      None => {
        debug!(key = %key, "Optimistic update aborted");
        self.phase = MutationPhase::Idle;
        false
      }
    }
  }

  /// Accept the optimistic value and discard the snapshot.
  pub fn commit(&mut self) {
    if self.phase != MutationPhase::AwaitingRemote {
      return;
    }
    self.snapshot = None;
    self.optimistic = None;
    self.phase = MutationPhase::Committed;
    debug!(key = %self.update.key(), "Committed optimistic update");
  }

  /// Commit, first replacing the entry with `f(current)` when the entry
  /// still has data and `f` returns a value.
  pub fn commit_with<F>(&mut self, f: F)
  where
    F: FnOnce(&U::Data) -> Option<U::Data>,
  {
    if self.phase != MutationPhase::AwaitingRemote {
      return;
    }
    self
      .cache
      .overlay_with::<U::Data, _>(self.update.key(), |current| match current.and_then(f) {
        Some(next) => Write::Set(next),
        None => Write::Skip,
      });
    self.commit();
  }

  /// Undo the optimistic write.
  pub fn rollback(&mut self) -> RollbackOutcome {
    if self.phase != MutationPhase::AwaitingRemote {
      return RollbackOutcome::NotApplied;
    }
    let Some(snapshot) = self.snapshot.take() else {
      return RollbackOutcome::NotApplied;
    };
    let optimistic = self.optimistic.take();
    self.phase = MutationPhase::RolledBack;

    let update = &self.update;
    let mut outcome = RollbackOutcome::Evicted;
    self
      .cache
      .overlay_with::<U::Data, _>(&snapshot.key, |current| match current {
        None => Write::Skip,
        Some(current) if Some(current) == optimistic.as_ref() => {
          outcome = RollbackOutcome::Restored;
          match &snapshot.value {
            Some(value) => Write::Set(value.clone()),
            None => Write::Remove,
          }
        }
        Some(current) => {
          outcome = RollbackOutcome::Reverted;
          Write::Set(update.revert(current, snapshot.value.as_ref()))
        }
      });

    debug!(key = %snapshot.key, ?outcome, "Rolled back optimistic update");
    outcome
  }
}

impl<U: OptimisticUpdate> Drop for MutationRun<U> {
  fn drop(&mut self) {
    if self.phase == MutationPhase::AwaitingRemote {
      warn!(key = %self.update.key(), "Mutation dropped before settling, rolling back");
      self.rollback();
    }
  }
}

impl<U: OptimisticUpdate> std::fmt::Debug for MutationRun<U> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MutationRun")
      .field("key", self.update.key())
      .field("phase", &self.phase)
      .finish_non_exhaustive()
  }
}
