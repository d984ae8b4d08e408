use lru::LruCache;
use std::num::NonZeroUsize;
use std::ops::{AddAssign, SubAssign};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Node {
    /// Sum of measured heights in the node's range.
    sum: f64,
    /// Number of measured items in the node's range.
    count: i64,
}

impl AddAssign for Node {
    fn add_assign(&mut self, rhs: Self) {
        self.sum += rhs.sum;
        self.count += rhs.count;
    }
}

impl SubAssign for Node {
    fn sub_assign(&mut self, rhs: Self) {
        self.sum -= rhs.sum;
        self.count -= rhs.count;
    }
}

/// Cumulative row offsets for variable-height rows.
///
/// A Fenwick tree tracks the sum and count of measured heights; unmeasured
/// rows are estimated at the running average of the measured ones, so
/// `offset(i) = measured_sum(<i) + (i - measured_count(<i)) * average`.
/// Offset and pixel lookups are O(log n); appending rows is O(log n) per row
/// and leaves existing measurements in place.
///
/// Measurements live in a bounded LRU. An evicted row drops out of the tree
/// and is estimated like any other unmeasured row.
#[derive(Debug)]
pub(crate) struct HeightIndex {
    /// 1-based; `tree[0]` is unused.
    tree: Vec<Node>,
    measured: LruCache<usize, f64>,
    measured_sum: f64,
    default_height: f64,
}

impl HeightIndex {
    pub fn new(default_height: f64, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tree: vec![Node::default()],
            measured: LruCache::new(capacity),
            measured_sum: 0.0,
            default_height,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len() - 1
    }

    #[cfg(test)]
    pub fn measured_len(&self) -> usize {
        self.measured.len()
    }

    pub fn clear(&mut self) {
        self.tree.truncate(1);
        self.tree.shrink_to_fit();
        self.measured.clear();
        self.measured_sum = 0.0;
    }

    /// Add `additional` unmeasured rows at the end.
    pub fn extend(&mut self, additional: usize) {
        self.tree.reserve(additional);
        for _ in 0..additional {
            let i = self.tree.len();
            // Node i covers (i - lowbit(i), i]; the new row contributes
            // nothing, so the node is the sum of its children.
            let lowbit = i & i.wrapping_neg();
            let mut node = Node::default();
            let mut step = 1;
            while step < lowbit {
                node += self.tree[i - step];
                step <<= 1;
            }
            self.tree.push(node);
        }
    }

    pub fn average(&self) -> f64 {
        if self.measured.is_empty() {
            self.default_height
        } else {
            self.measured_sum / self.measured.len() as f64
        }
    }

    /// Measured height of `index`, or the running average.
    pub fn height(&self, index: usize) -> f64 {
        self.measured
            .peek(&index)
            .copied()
            .unwrap_or_else(|| self.average())
    }

    /// Top edge of row `index`; `offset(len)` is the total height.
    pub fn offset(&self, index: usize) -> f64 {
        let index = index.min(self.len());
        let node = self.prefix(index);
        node.sum + (index as i64 - node.count) as f64 * self.average()
    }

    pub fn total(&self) -> f64 {
        self.offset(self.len())
    }

    /// Row containing pixel `y`, clamped to the last row. Zero when empty.
    pub fn index_at(&self, y: f64) -> usize {
        let len = self.len();
        if len == 0 {
            return 0;
        }
        let average = self.average();
        let mut pos = 0;
        let mut acc = 0.0;
        let mut step = 1usize << (usize::BITS - 1 - len.leading_zeros());
        while step > 0 {
            let next = pos + step;
            if next <= len {
                let node = self.tree[next];
                let span = node.sum + (step as i64 - node.count) as f64 * average;
                if acc + span <= y {
                    pos = next;
                    acc += span;
                }
            }
            step >>= 1;
        }
        pos.min(len - 1)
    }

    /// Record a measurement. Returns the change in total height.
    pub fn set(&mut self, index: usize, height: f64) -> f64 {
        if index >= self.len() {
            return 0.0;
        }
        let before = self.total();
        match self.measured.push(index, height) {
            Some((old_index, old)) if old_index == index => {
                self.measured_sum += height - old;
                self.add(
                    index,
                    Node {
                        sum: height - old,
                        count: 0,
                    },
                );
            }
            evicted => {
                if let Some((evicted_index, evicted_height)) = evicted {
                    self.measured_sum -= evicted_height;
                    self.sub(
                        evicted_index,
                        Node {
                            sum: evicted_height,
                            count: 1,
                        },
                    );
                }
                self.measured_sum += height;
                self.add(
                    index,
                    Node {
                        sum: height,
                        count: 1,
                    },
                );
            }
        }
        self.total() - before
    }

    fn prefix(&self, mut i: usize) -> Node {
        let mut acc = Node::default();
        while i > 0 {
            acc += self.tree[i];
            i &= i - 1;
        }
        acc
    }

    fn add(&mut self, index: usize, delta: Node) {
        let mut i = index + 1;
        while i < self.tree.len() {
            self.tree[i] += delta;
            i += i & i.wrapping_neg();
        }
    }

    fn sub(&mut self, index: usize, delta: Node) {
        let mut i = index + 1;
        while i < self.tree.len() {
            self.tree[i] -= delta;
            i += i & i.wrapping_neg();
        }
    }
}
