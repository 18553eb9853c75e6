//! Array-backed binary min-heap of slot indices ordered by deadline.
//!
//! The heap stores indices into a slot arena owned by the caller. Every move
//! writes the node's new position back into its slot, so arbitrary entries
//! can be removed in O(log n) when a task is cancelled or re-primed.

/// Arena entry that can be ordered by the heap.
pub trait HeapSlot {
    /// Absolute deadline used for ordering.
    fn deadline(&self) -> u64;
    /// Record the entry's position in the heap.
    fn set_heap_index(&mut self, index: Option<usize>);
    /// Position recorded by the heap.
    fn heap_index(&self) -> Option<usize>;
}

/// Fixed-capacity min-heap over arena indices.
#[derive(Debug)]
pub struct DeadlineHeap {
    nodes: Box<[u32]>,
    len: usize,
}

impl DeadlineHeap {
    /// Empty heap holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no entry is queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Slot index with the earliest deadline.
    pub fn peek(&self) -> Option<usize> {
        (self.len > 0).then(|| self.nodes[0] as usize)
    }

    /// Earliest deadline.
    pub fn min_deadline<T: HeapSlot>(&self, slots: &[T]) -> Option<u64> {
        self.peek().map(|slot| slots[slot].deadline())
    }

    /// Queue `slot`. Returns `false` if the heap is full.
    pub fn push<T: HeapSlot>(&mut self, slots: &mut [T], slot: usize) -> bool {
        if self.len == self.nodes.len() {
            return false;
        }
        let Ok(node) = u32::try_from(slot) else {
            return false;
        };
        let position = self.len;
        self.nodes[position] = node;
        self.len += 1;
        slots[slot].set_heap_index(Some(position));
        self.sift_up(slots, position);
        true
    }

    /// Remove and return the earliest entry.
    pub fn pop<T: HeapSlot>(&mut self, slots: &mut [T]) -> Option<usize> {
        let root = self.peek()?;
        self.remove_at(slots, 0);
        Some(root)
    }

    /// Remove the entry at heap position `position`.
    ///
    /// Swaps with the last node, shrinks, and sifts the moved node in
    /// whichever direction restores the ordering.
    pub fn remove_at<T: HeapSlot>(&mut self, slots: &mut [T], position: usize) -> Option<usize> {
        if position >= self.len {
            return None;
        }
        let removed = self.nodes[position] as usize;
        let last = self.len - 1;
        self.swap(slots, position, last);
        self.len = last;
        slots[removed].set_heap_index(None);

        if position < self.len {
            if position > 0 && self.less(slots, position, parent(position)) {
                self.sift_up(slots, position);
            } else {
                self.sift_down(slots, position);
            }
        }
        Some(removed)
    }

    /// Remove `slot` if it is queued.
    pub fn remove<T: HeapSlot>(&mut self, slots: &mut [T], slot: usize) -> bool {
        match slots[slot].heap_index() {
            Some(position) if position < self.len && self.nodes[position] as usize == slot => {
                self.remove_at(slots, position);
                true
            }
            _ => false,
        }
    }

    /// Queued slot indices in heap order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes[..self.len].iter().map(|&n| n as usize)
    }

    /// Check parent/child ordering and back-references.
    pub fn is_valid<T: HeapSlot>(&self, slots: &[T]) -> bool {
        (0..self.len).all(|position| {
            let slot = self.nodes[position] as usize;
            let linked = slots[slot].heap_index() == Some(position);
            let ordered =
                position == 0 || !self.less(slots, position, parent(position));
            linked && ordered
        })
    }

    fn less<T: HeapSlot>(&self, slots: &[T], a: usize, b: usize) -> bool {
        slots[self.nodes[a] as usize].deadline() < slots[self.nodes[b] as usize].deadline()
    }

    fn swap<T: HeapSlot>(&mut self, slots: &mut [T], a: usize, b: usize) {
        self.nodes.swap(a, b);
        slots[self.nodes[a] as usize].set_heap_index(Some(a));
        slots[self.nodes[b] as usize].set_heap_index(Some(b));
    }

    fn sift_up<T: HeapSlot>(&mut self, slots: &mut [T], mut position: usize) {
        while position > 0 {
            let up = parent(position);
            if !self.less(slots, position, up) {
                break;
            }
            self.swap(slots, position, up);
            position = up;
        }
    }

    fn sift_down<T: HeapSlot>(&mut self, slots: &mut [T], mut position: usize) {
        loop {
            let left = 2 * position + 1;
            if left >= self.len {
                break;
            }
            let right = left + 1;
            let child = if right < self.len && self.less(slots, right, left) {
                right
            } else {
                left
            };
            if !self.less(slots, child, position) {
                break;
            }
            self.swap(slots, position, child);
            position = child;
        }
    }
}

#[inline]
fn parent(position: usize) -> usize {
    (position - 1) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone)]
    struct Slot {
        deadline: u64,
        index: Option<usize>,
    }

    impl HeapSlot for Slot {
        fn deadline(&self) -> u64 {
            self.deadline
        }
        fn set_heap_index(&mut self, index: Option<usize>) {
            self.index = index;
        }
        fn heap_index(&self) -> Option<usize> {
            self.index
        }
    }

    fn arena(deadlines: &[u64]) -> Vec<Slot> {
        deadlines
            .iter()
            .map(|&deadline| Slot {
                deadline,
                index: None,
            })
            .collect()
    }

    #[test]
    fn test_pop_in_deadline_order() {
        let mut slots = arena(&[50, 10, 40, 20, 30, 10]);
        let mut heap = DeadlineHeap::with_capacity(slots.len());
        for slot in 0..slots.len() {
            assert!(heap.push(&mut slots, slot));
            assert!(heap.is_valid(&slots));
        }

        let mut order = Vec::new();
        while let Some(slot) = heap.pop(&mut slots) {
            assert!(heap.is_valid(&slots));
            order.push(slots[slot].deadline);
        }
        assert_eq!(order, vec![10, 10, 20, 30, 40, 50]);
        assert!(slots.iter().all(|s| s.index.is_none()));
    }

    #[test]
    fn test_full_heap_rejects_push() {
        let mut slots = arena(&[1, 2, 3]);
        let mut heap = DeadlineHeap::with_capacity(2);
        assert!(heap.push(&mut slots, 0));
        assert!(heap.push(&mut slots, 1));
        assert!(!heap.push(&mut slots, 2));
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn test_remove_arbitrary_entry() {
        let mut slots = arena(&[5, 15, 25, 35, 45, 55, 65]);
        let mut heap = DeadlineHeap::with_capacity(slots.len());
        for slot in 0..slots.len() {
            heap.push(&mut slots, slot);
        }

        assert!(heap.remove(&mut slots, 3));
        assert!(heap.is_valid(&slots));
        assert!(!heap.remove(&mut slots, 3));
        assert!(heap.remove(&mut slots, 0));
        assert!(heap.is_valid(&slots));
        assert_eq!(heap.min_deadline(&slots), Some(15));
        assert_eq!(heap.len(), 5);
    }

    #[test]
    fn test_removal_sifts_up_when_needed() {
        // Removing a deep node from one subtree can pull a smaller last node
        // above its new parent.
        let mut slots = arena(&[1, 100, 2, 101, 102, 3, 4]);
        let mut heap = DeadlineHeap::with_capacity(slots.len());
        for slot in 0..slots.len() {
            heap.push(&mut slots, slot);
        }
        assert!(heap.remove(&mut slots, 3));
        assert!(heap.is_valid(&slots));
        assert!(heap.remove(&mut slots, 4));
        assert!(heap.is_valid(&slots));
    }

    #[test]
    fn test_reprioritise_by_remove_and_push() {
        let mut slots = arena(&[10, 20, 30]);
        let mut heap = DeadlineHeap::with_capacity(3);
        for slot in 0..3 {
            heap.push(&mut slots, slot);
        }
        heap.remove(&mut slots, 2);
        slots[2].deadline = 1;
        heap.push(&mut slots, 2);
        assert_eq!(heap.peek(), Some(2));
        assert!(heap.is_valid(&slots));
    }
}
