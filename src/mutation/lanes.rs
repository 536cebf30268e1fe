use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

type LaneMap = HashMap<String, Weak<AsyncMutex<()>>>;

/// Per-id serialization of mutations.
///
/// Holding the guard returned by [`MutationLanes::acquire`] keeps every
/// other mutation on the same id waiting; waiters are admitted in arrival
/// order. Lanes are dropped once nobody holds or waits on them.
#[derive(Debug, Default)]
pub struct MutationLanes {
  lanes: Mutex<LaneMap>,
}

impl MutationLanes {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self, op: &'static str) -> MutexGuard<'_, LaneMap> {
    match self.lanes.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        warn!(op, "Recovered from poisoned mutation lanes lock");
        poisoned.into_inner()
      }
    }
  }

  /// Wait for the lane of `id` and hold it until the guard is dropped.
  pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
    let lane = {
      let mut lanes = self.lock("acquire");
      lanes.retain(|_, lane| lane.strong_count() > 0);

      match lanes.get(id).and_then(Weak::upgrade) {
        Some(lane) => lane,
        None => {
          let lane = Arc::new(AsyncMutex::new(()));
          lanes.insert(id.to_string(), Arc::downgrade(&lane));
          lane
        }
      }
    };

    lane.lock_owned().await
  }

  /// Number of lanes currently held or waited on.
  pub fn active(&self) -> usize {
    self
      .lock("active")
      .values()
      .filter(|lane| lane.strong_count() > 0)
      .count()
  }
}
