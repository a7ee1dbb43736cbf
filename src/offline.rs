//! Bounded priority buffer for requests parked while disconnected

use crate::request::Priority;

/// Outcome of [`OfflineQueue::add`].
///
/// Ownership makes the source's boolean contract explicit: a rejected or
/// evicted entry comes back to the caller, which must fail its outcome.
#[derive(Debug)]
pub enum AddResult<T> {
    /// Entry stored
    Added,
    /// Entry stored; the returned oldest `low`-priority entry was evicted
    /// to make room
    Evicted(T),
    /// Queue full of `high`/`normal` work; the entry is handed back
    Rejected(T),
}

struct Slot<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

/// A bounded, priority-ordered holding area for requests that cannot be
/// dispatched because the system is offline.
///
/// Not internally synchronized; the queue owns it behind its state lock and
/// treats the reconnect drain as a critical section.
pub struct OfflineQueue<T> {
    max_size: usize,
    seq: u64,
    slots: Vec<Slot<T>>,
}

impl<T> OfflineQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            seq: 0,
            slots: Vec::new(),
        }
    }

    /// Inserts an entry, evicting the oldest `low`-priority entry when at
    /// capacity. A queue full of `high`/`normal` entries rejects the add;
    /// callers must treat that as backpressure.
    pub fn add(&mut self, item: T, priority: Priority) -> AddResult<T> {
        let evicted = if self.slots.len() >= self.max_size {
            match self.evict_oldest_low() {
                Some(old) => Some(old),
                None => return AddResult::Rejected(item),
            }
        } else {
            None
        };

        self.seq += 1;
        self.slots.push(Slot {
            priority,
            seq: self.seq,
            item,
        });
        match evicted {
            Some(old) => AddResult::Evicted(old),
            None => AddResult::Added,
        }
    }

    fn evict_oldest_low(&mut self) -> Option<T> {
        let idx = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.priority == Priority::Low)
            .min_by_key(|(_, s)| s.seq)
            .map(|(i, _)| i)?;
        Some(self.slots.remove(idx).item)
    }

    /// Removes and returns all entries, `high` before `normal` before `low`,
    /// FIFO within a tier.
    pub fn drain(&mut self) -> Vec<T> {
        let mut slots = std::mem::take(&mut self.slots);
        slots.sort_by_key(|s| (s.priority, s.seq));
        slots.into_iter().map(|s| s.item).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Discards all entries without returning them.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
