//! Single-producer/single-consumer ring of expired task tickets.
//!
//! The expiry path is the only producer and writes `head`; the drain is the
//! only consumer and writes `tail`. Each side only reads the other's index,
//! so neither needs a lock. Indices run freely and are masked on access, so
//! all `capacity` slots are usable.
//!
//! A full ring drops the new ticket. Dropped periodic fires recur at their
//! next period; callers size the ring for their throughput.

use crate::scheduler::Ticket;
use crossbeam_utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Lock-free SPSC ring of [`Ticket`]s.
#[derive(Debug)]
pub struct DeferredQueue {
    slots: Box<[AtomicU64]>,
    mask: usize,
    /// Next write position (producer).
    head: CachePadded<AtomicUsize>,
    /// Next read position (consumer).
    tail: CachePadded<AtomicUsize>,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    peak: AtomicUsize,
}

/// Counters of a [`DeferredQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Slots in the ring.
    pub capacity: usize,
    /// Tickets currently queued.
    pub depth: usize,
    /// Highest depth observed.
    pub peak_depth: usize,
    /// Tickets accepted.
    pub enqueued: u64,
    /// Tickets dropped on overflow.
    pub dropped: u64,
}

impl DeferredQueue {
    /// Ring with at least `capacity` slots, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Producer side. Returns `false` and counts a drop when full.
    pub fn enqueue(&self, ticket: Ticket) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let depth = head.wrapping_sub(tail);
        if depth >= self.slots.len() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.slots[head & self.mask].store(ticket.to_bits(), Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(depth + 1, Ordering::Relaxed);
        true
    }

    /// Consumer side. Never reads past `head`.
    pub fn dequeue(&self) -> Option<Ticket> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let bits = self.slots[tail & self.mask].load(Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(Ticket::from_bits(bits))
    }

    /// Tickets currently queued.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total tickets dropped on overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.slots.len(),
            depth: self.len(),
            peak_depth: self.peak.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped(),
        }
    }

    /// Discard queued tickets. Consumer side only.
    pub fn clear(&self) {
        while self.dequeue().is_some() {}
    }
}
