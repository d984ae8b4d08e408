use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Priority queue keyed by task id: highest priority first, FIFO among equals,
/// with O(log n) removal of an arbitrary queued entry.
#[derive(Debug)]
pub(crate) struct TaskQueue<T> {
    entries: BTreeMap<(Reverse<i32>, u64), (u64, T)>,
    positions: HashMap<u64, (Reverse<i32>, u64)>,
    next_seq: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            positions: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn push(&mut self, id: u64, priority: i32, item: T) {
        let key = (Reverse(priority), self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.insert(key, (id, item));
        self.positions.insert(id, key);
    }

    pub fn pop(&mut self) -> Option<(u64, T)> {
        let (_, (id, item)) = self.entries.pop_first()?;
        self.positions.remove(&id);
        Some((id, item))
    }

    pub fn remove(&mut self, id: u64) -> Option<T> {
        let key = self.positions.remove(&id)?;
        self.entries.remove(&key).map(|(_, item)| item)
    }

    pub fn drain(&mut self) -> Vec<(u64, T)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.pop() {
            out.push(entry);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
