use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::store::Store;

/// One committed change as seen by an observer.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub doc_id: String,
    pub sequence: u64,
    /// Instance id of the database handle that performed the write.
    pub source: u64,
}

pub(crate) struct ObserverInner {
    /// Instance id of the database handle that owns this observer; entries
    /// from any other source are "external" to it.
    pub owner: u64,
    pub queue: Mutex<VecDeque<ChangeEntry>>,
    pub callback: Box<dyn Fn() + Send + Sync>,
}

/// Handle to a registered store observer. Dropping it unregisters.
pub struct ObserverToken {
    pub(crate) store: Store,
    pub(crate) id: u64,
    pub(crate) inner: Arc<ObserverInner>,
}

impl ObserverToken {
    /// Drain up to `max` pending entries that share one externality, with
    /// the flag that applies to all of them. A mixed queue stops at the
    /// first entry whose externality differs, so callers see homogeneous
    /// batches.
    pub fn changes(&self, max: usize) -> (Vec<ChangeEntry>, bool) {
        let mut queue = self.inner.queue.lock();
        let external = match queue.front() {
            Some(entry) => entry.source != self.inner.owner,
            None => return (Vec::new(), false),
        };

        let mut entries = Vec::new();
        while entries.len() < max {
            match queue.front() {
                Some(entry) if (entry.source != self.inner.owner) == external => {
                    entries.push(queue.pop_front().unwrap());
                }
                _ => break,
            }
        }
        (entries, external)
    }
}

impl Drop for ObserverToken {
    fn drop(&mut self) {
        self.store.remove_observer(self.id);
    }
}
