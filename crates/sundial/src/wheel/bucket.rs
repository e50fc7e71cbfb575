//! A single wheel slot

use crate::task::{TaskEntry, TaskId};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Tasks whose tick maps to one slot of the wheel.
///
/// A slot is shared by ticks `s, s + N, s + 2N, ...`; each entry remembers
/// its own tick, so a drain on tick `t` takes only the entries of the current
/// revolution (`entry.tick <= t`) and leaves later revolutions in place.
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    entries: FxHashMap<TaskId, Arc<TaskEntry>>,
    /// Highest tick this slot has been drained for
    drained_through: Option<u64>,
}

impl Bucket {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the drain for `tick` has already happened. An entry inserted
    /// for such a tick would wait a whole revolution.
    pub(crate) fn has_drained(&self, tick: u64) -> bool {
        self.drained_through.is_some_and(|drained| drained >= tick)
    }

    pub(crate) fn insert(&mut self, entry: Arc<TaskEntry>) {
        debug_assert!(!self.has_drained(entry.tick()));
        self.entries.insert(entry.id(), entry);
    }

    /// Remove an entry that is still waiting. Returns `false` if a drain
    /// already took it.
    pub(crate) fn remove(&mut self, entry: &TaskEntry) -> bool {
        self.entries.remove(&entry.id()).is_some()
    }

    /// Move every entry due by `tick` into `out`, marking each Dispatching.
    /// Returns how many entries left the bucket.
    pub(crate) fn drain(&mut self, tick: u64, out: &mut Vec<Arc<TaskEntry>>) -> usize {
        let before = self.len();
        self.entries.retain(|_, entry| {
            if entry.tick() > tick {
                return true;
            }
            // Cancellation removes entries under the bucket lock, so every
            // entry still here is pending
            if entry.begin_dispatch() {
                out.push(entry.clone());
            }
            false
        });
        self.drained_through = Some(self.drained_through.map_or(tick, |drained| drained.max(tick)));
        before - self.entries.len()
    }
}
