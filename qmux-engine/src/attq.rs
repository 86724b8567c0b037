// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;

use qmux_common::Time;

use crate::engine::ConnectionHandle;

#[derive(Clone, Copy, Debug)]
struct Entry {
    time: Time,
    conn: ConnectionHandle,
}

/// The advisory tick-time queue: a min-heap of connections keyed by
/// when they next want a tick, with at most one entry per connection.
/// Rescheduling removes and re-adds, so a position map rides along.
#[derive(Debug, Default)]
pub(crate) struct Attq {
    heap: Vec<Entry>,
    pos: HashMap<ConnectionHandle, usize>,
}

impl Attq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, conn: ConnectionHandle) -> bool {
        self.pos.contains_key(&conn)
    }

    /// Earliest scheduled tick time, if any.
    pub fn min_time(&self) -> Option<Time> {
        self.heap.first().map(|e| e.time)
    }

    /// Schedule `conn` at `time`.
    ///
    /// # Panics
    /// When `conn` is already scheduled.
    pub fn add(&mut self, conn: ConnectionHandle, time: Time) {
        assert!(!self.contains(conn), "{conn} is already on the ATTQ");
        if self.heap.len() == self.heap.capacity() {
            let want = std::cmp::max(8, self.heap.capacity() * 4);
            self.heap.reserve_exact(want - self.heap.len());
        }
        let idx = self.heap.len();
        self.heap.push(Entry { time, conn });
        self.pos.insert(conn, idx);
        self.sift_up(idx);
    }

    /// Drop `conn`'s entry if it has one.
    pub fn remove(&mut self, conn: ConnectionHandle) -> bool {
        let Some(idx) = self.pos.remove(&conn) else {
            return false;
        };
        let last = self.heap.len() - 1;
        self.heap.swap_remove(idx);
        if idx < last {
            let moved = self.heap[idx].conn;
            self.pos.insert(moved, idx);
            // The filler may belong either above or below its new slot.
            self.sift_down(idx);
            self.sift_up(idx);
        }
        true
    }

    /// Pop the head entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Time) -> Option<ConnectionHandle> {
        let head = self.heap.first()?;
        if head.time > now {
            return None;
        }
        let conn = head.conn;
        self.remove(conn);
        Some(conn)
    }

    /// Number of entries scheduled at or before `cutoff`.
    pub fn count_before(&self, cutoff: Time) -> usize {
        self.heap.iter().filter(|e| e.time <= cutoff).count()
    }

    pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.heap.iter().map(|e| e.conn)
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[parent].time <= self.heap[idx].time {
                break;
            }
            self.swap(parent, idx);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let mut least = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < self.heap.len() && self.heap[child].time < self.heap[least].time {
                    least = child;
                }
            }
            if least == idx {
                break;
            }
            self.swap(least, idx);
            idx = least;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos.insert(self.heap[a].conn, a);
        self.pos.insert(self.heap[b].conn, b);
    }
}

#[cfg(test)]
mod tests {
    use qmux_common::Time;

    use super::Attq;
    use crate::engine::ConnectionHandle;

    fn t(us: u64) -> Time {
        Time::from_micros(us)
    }

    fn h(i: usize) -> ConnectionHandle {
        ConnectionHandle(i)
    }

    #[test]
    fn pops_in_time_order() {
        let mut q = Attq::new();
        for (i, us) in [50, 10, 30, 20, 40].iter().enumerate() {
            q.add(h(i), t(*us));
        }
        assert_eq!(q.min_time(), Some(t(10)));
        let mut order = Vec::new();
        while let Some(c) = q.pop_due(t(100)) {
            order.push(c);
        }
        assert_eq!(order, vec![h(1), h(3), h(2), h(4), h(0)]);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_due_respects_now() {
        let mut q = Attq::new();
        q.add(h(0), t(10));
        q.add(h(1), t(20));
        assert_eq!(q.pop_due(t(5)), None);
        assert_eq!(q.pop_due(t(10)), Some(h(0)));
        assert_eq!(q.pop_due(t(10)), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_middle_keeps_order() {
        let mut q = Attq::new();
        for (i, us) in [15, 5, 25, 35, 45, 55, 65].iter().enumerate() {
            q.add(h(i), t(*us));
        }
        assert!(q.remove(h(3)));
        assert!(!q.remove(h(3)));
        let mut times = Vec::new();
        while let Some(c) = q.pop_due(t(1000)) {
            assert_ne!(c, h(3));
            times.push(c);
        }
        assert_eq!(times.len(), 6);
    }

    #[test]
    fn reschedule_is_remove_then_add() {
        let mut q = Attq::new();
        q.add(h(0), t(100));
        q.add(h(1), t(50));
        assert!(q.remove(h(0)));
        q.add(h(0), t(10));
        assert_eq!(q.pop_due(t(1000)), Some(h(0)));
        assert_eq!(q.pop_due(t(1000)), Some(h(1)));
    }

    #[test]
    fn count_before() {
        let mut q = Attq::new();
        q.add(h(0), t(10));
        q.add(h(1), t(20));
        q.add(h(2), t(30));
        assert_eq!(q.count_before(t(9)), 0);
        assert_eq!(q.count_before(t(20)), 2);
        assert_eq!(q.count_before(t(99)), 3);
    }

    #[test]
    #[should_panic(expected = "already on the ATTQ")]
    fn double_add_asserts() {
        let mut q = Attq::new();
        q.add(h(0), t(10));
        q.add(h(0), t(20));
    }
}
