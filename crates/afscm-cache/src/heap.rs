//! Indexed binary min-heap of slots keyed by lease expiry.

use crate::entry::SlotId;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct InvalidationHeap {
    items: Vec<(Instant, SlotId)>,
    pos: HashMap<SlotId, usize>,
}

impl InvalidationHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.pos.contains_key(&slot)
    }

    pub fn expiry(&self, slot: SlotId) -> Option<Instant> {
        self.pos.get(&slot).map(|&i| self.items[i].0)
    }

    /// Inserts `slot`, or moves it if it is already queued. Returns true when
    /// it became the new minimum.
    pub fn insert(&mut self, slot: SlotId, at: Instant) -> bool {
        match self.pos.get(&slot).copied() {
            Some(i) => {
                let old = self.items[i].0;
                self.items[i].0 = at;
                if at < old {
                    self.sift_up(i);
                } else {
                    self.sift_down(i);
                }
            }
            None => {
                self.items.push((at, slot));
                let i = self.items.len() - 1;
                self.pos.insert(slot, i);
                self.sift_up(i);
            }
        }
        self.items.first().map(|(_, s)| *s) == Some(slot)
    }

    pub fn remove(&mut self, slot: SlotId) -> Option<Instant> {
        let i = self.pos.remove(&slot)?;
        let last = self.items.len() - 1;
        self.items.swap(i, last);
        let (at, _) = self.items.pop()?;
        if i < self.items.len() {
            self.pos.insert(self.items[i].1, i);
            self.sift_down(i);
            self.sift_up(i);
        }
        Some(at)
    }

    pub fn peek(&self) -> Option<(Instant, SlotId)> {
        self.items.first().copied()
    }

    pub fn pop(&mut self) -> Option<(Instant, SlotId)> {
        let (_, slot) = self.peek()?;
        self.remove(slot).map(|at| (at, slot))
    }

    /// Pops every slot whose expiry is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<SlotId> {
        let mut out = Vec::new();
        while let Some((at, slot)) = self.peek() {
            if at > now {
                break;
            }
            self.remove(slot);
            out.push(slot);
        }
        out
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.pos.insert(self.items[a].1, a);
        self.pos.insert(self.items[b].1, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.items[i].0 >= self.items[parent].0 {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.items.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < n && self.items[left].0 < self.items[smallest].0 {
                smallest = left;
            }
            if right < n && self.items[right].0 < self.items[smallest].0 {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn test_pop_in_expiry_order() {
        let base = Instant::now();
        let mut heap = InvalidationHeap::new();
        heap.insert(SlotId(1), at(base, 30));
        heap.insert(SlotId(2), at(base, 10));
        heap.insert(SlotId(3), at(base, 20));
        assert_eq!(heap.pop().map(|(_, s)| s), Some(SlotId(2)));
        assert_eq!(heap.pop().map(|(_, s)| s), Some(SlotId(3)));
        assert_eq!(heap.pop().map(|(_, s)| s), Some(SlotId(1)));
        assert!(heap.pop().is_none());
    }

    #[test]
    fn test_insert_reports_new_minimum() {
        let base = Instant::now();
        let mut heap = InvalidationHeap::new();
        assert!(heap.insert(SlotId(1), at(base, 30)));
        assert!(!heap.insert(SlotId(2), at(base, 40)));
        assert!(heap.insert(SlotId(3), at(base, 5)));
    }

    #[test]
    fn test_rekey_existing_slot() {
        let base = Instant::now();
        let mut heap = InvalidationHeap::new();
        heap.insert(SlotId(1), at(base, 10));
        heap.insert(SlotId(2), at(base, 20));
        heap.insert(SlotId(1), at(base, 30));
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.peek().map(|(_, s)| s), Some(SlotId(2)));
        assert_eq!(heap.expiry(SlotId(1)), Some(at(base, 30)));
    }

    #[test]
    fn test_remove_middle() {
        let base = Instant::now();
        let mut heap = InvalidationHeap::new();
        for (i, secs) in [50u64, 10, 40, 20, 30].iter().enumerate() {
            heap.insert(SlotId(i as u16), at(base, *secs));
        }
        assert_eq!(heap.remove(SlotId(3)), Some(at(base, 20)));
        assert!(!heap.contains(SlotId(3)));
        assert!(heap.remove(SlotId(3)).is_none());
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|(_, s)| s)).collect();
        assert_eq!(order, vec![SlotId(1), SlotId(4), SlotId(2), SlotId(0)]);
    }

    #[test]
    fn test_pop_expired_is_inclusive() {
        let base = Instant::now();
        let mut heap = InvalidationHeap::new();
        heap.insert(SlotId(1), at(base, 10));
        heap.insert(SlotId(2), at(base, 11));
        assert!(heap.pop_expired(at(base, 9)).is_empty());
        assert_eq!(heap.pop_expired(at(base, 10)), vec![SlotId(1)]);
        assert_eq!(heap.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_pops_sorted(ops in proptest::collection::vec((0u16..32, 0u64..1000, any::<bool>()), 1..200)) {
            let base = Instant::now();
            let mut heap = InvalidationHeap::new();
            let mut model: HashMap<SlotId, Instant> = HashMap::new();
            for (slot, secs, remove) in ops {
                let slot = SlotId(slot);
                if remove {
                    prop_assert_eq!(heap.remove(slot), model.remove(&slot));
                } else {
                    heap.insert(slot, at(base, secs));
                    model.insert(slot, at(base, secs));
                }
            }
            prop_assert_eq!(heap.len(), model.len());
            let mut last = None;
            while let Some((when, slot)) = heap.pop() {
                prop_assert_eq!(model.remove(&slot), Some(when));
                if let Some(prev) = last {
                    prop_assert!(prev <= when);
                }
                last = Some(when);
            }
            prop_assert!(model.is_empty());
        }
    }
}
