// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use qmux_common::Time;

use crate::engine::ConnectionHandle;

/// Min-heap of connections keyed by a timestamp; used for both the
/// tickable queue (keyed by last-ticked) and the outgoing queue (keyed
/// by last-sent). Grows by `max(8, 4 x capacity)` so repeated inserts
/// do not cause growth storms.
#[derive(Debug, Default)]
pub(crate) struct ConnHeap {
    heap: Vec<(Time, ConnectionHandle)>,
}

impl ConnHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.heap.capacity()
    }

    pub fn insert(&mut self, key: Time, conn: ConnectionHandle) {
        if self.heap.len() == self.heap.capacity() {
            let want = std::cmp::max(8, self.heap.capacity() * 4);
            self.heap.reserve_exact(want - self.heap.len());
        }
        let mut idx = self.heap.len();
        self.heap.push((key, conn));
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[parent].0 <= self.heap[idx].0 {
                break;
            }
            self.heap.swap(parent, idx);
            idx = parent;
        }
    }

    pub fn pop(&mut self) -> Option<(Time, ConnectionHandle)> {
        if self.heap.is_empty() {
            return None;
        }
        let top = self.heap.swap_remove(0);
        let mut idx = 0;
        loop {
            let mut least = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < self.heap.len() && self.heap[child].0 < self.heap[least].0 {
                    least = child;
                }
            }
            if least == idx {
                break;
            }
            self.heap.swap(least, idx);
            idx = least;
        }
        Some(top)
    }

    pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.heap.iter().map(|e| e.1)
    }
}
