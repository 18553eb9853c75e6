//! Deadline scheduler: fixed task table, min-heap, and slot generations.
//!
//! The scheduler has no clock of its own; every operation that needs the
//! current time takes it as `now` (microseconds since boot). Callers are
//! responsible for masking the timer interrupt around each call.
//!
//! # Slot lifecycle
//!
//! ```text
//! Free -> Registered -> Armed -> Free        (one-shot fired, removed)
//!                         \--> Armed          (periodic re-armed)
//! ```
//!
//! Every transition bumps the slot generation. A [`Ticket`] captures the
//! slot and generation at publish time; a drain only honours tickets whose
//! generation still matches.
//!
//! A fired one-shot keeps its task id on the slot until the fire is claimed,
//! so a cancel or re-insert in between still reaches the slot and bumps its
//! generation.

use crate::heap::{DeadlineHeap, HeapSlot};
use serde::Serialize;
use std::fmt;
use tm_common::error::{TmError, TmResult};

/// Opaque identity of a caller-owned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Reserved null identity; always rejected.
    pub const NULL: Self = Self(0);

    /// Whether this is the null identity.
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Slot index and generation packed into one word.
///
/// The high half is the slot, the low half the generation, so the value can
/// cross from interrupt to mainline context in a single atomic store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

static_assertions::assert_eq_size!(Ticket, u64);

impl Ticket {
    /// Pack a slot and generation.
    pub fn new(slot: u32, generation: u32) -> Self {
        Self((u64::from(slot) << 32) | u64::from(generation))
    }

    /// Slot index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn slot(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Generation at publish time.
    #[allow(clippy::cast_possible_truncation)]
    pub fn generation(self) -> u32 {
        self.0 as u32
    }

    /// Raw packed value.
    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// Unpack a raw value.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slot(), self.generation())
    }
}

/// One slot of the task table.
#[derive(Debug, Clone, Default)]
pub struct TaskEntry {
    owner: Option<TaskId>,
    periodic: bool,
    deadline: u64,
    period: u64,
    generation: u32,
    heap_index: Option<usize>,
    /// Deadline of the most recent fire.
    fired_deadline: u64,
    /// Published fire not yet claimed by a drain.
    pending_drain: bool,
    /// One-shot task whose published fire is still unclaimed.
    retired: Option<TaskId>,
}

impl TaskEntry {
    /// Owning task, if registered.
    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// Absolute deadline in microseconds.
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Period in microseconds, 0 for one-shot.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Current generation.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the slot is queued in the heap.
    pub fn is_armed(&self) -> bool {
        self.heap_index.is_some()
    }

    fn bump(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }
}

impl HeapSlot for TaskEntry {
    fn deadline(&self) -> u64 {
        self.deadline
    }

    fn set_heap_index(&mut self, index: Option<usize>) {
        self.heap_index = index;
    }

    fn heap_index(&self) -> Option<usize> {
        self.heap_index
    }
}

/// Result of an expiry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryPass {
    /// Entries popped as due.
    pub expired: u32,
    /// Tickets accepted by the publisher.
    pub published: u32,
    /// Tickets the publisher rejected.
    pub dropped: u32,
    /// Periodic entries rescheduled from `now` instead of their old deadline.
    pub clamped: u32,
}

/// Fixed-capacity deadline scheduler.
#[derive(Debug)]
pub struct Scheduler {
    slots: Box<[TaskEntry]>,
    heap: DeadlineHeap,
    catch_up_limit: u32,
}

impl Scheduler {
    /// Scheduler with `capacity` slots and catch-up cap `catch_up_limit`.
    ///
    /// # Errors
    ///
    /// Returns [`TmError::Param`] for a zero capacity, a capacity beyond the
    /// ticket slot range, or a zero catch-up cap.
    pub fn new(capacity: usize, catch_up_limit: u32) -> TmResult<Self> {
        if capacity == 0 || u32::try_from(capacity).is_err() {
            return Err(TmError::param(format!("invalid task capacity {capacity}")));
        }
        if catch_up_limit == 0 {
            return Err(TmError::param("catch-up limit must be at least 1"));
        }
        Ok(Self {
            slots: vec![TaskEntry::default(); capacity].into_boxed_slice(),
            heap: DeadlineHeap::with_capacity(capacity),
            catch_up_limit,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Catch-up cap in periods.
    pub fn catch_up_limit(&self) -> u32 {
        self.catch_up_limit
    }

    /// Registered tasks.
    pub fn registered_count(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_some()).count()
    }

    /// Armed tasks.
    pub fn active_count(&self) -> usize {
        self.heap.len()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.min_deadline(&self.slots)
    }

    /// Slot view, for diagnostics.
    pub fn entry(&self, slot: usize) -> Option<&TaskEntry> {
        self.slots.get(slot)
    }

    /// Slot currently owned by `task`.
    pub fn slot_of(&self, task: TaskId) -> Option<usize> {
        if task.is_null() {
            return None;
        }
        self.slots.iter().position(|s| s.owner == Some(task))
    }

    /// Slot holding an unclaimed one-shot fire of `task`.
    pub fn retired_slot_of(&self, task: TaskId) -> Option<usize> {
        if task.is_null() {
            return None;
        }
        self.slots
            .iter()
            .position(|s| s.pending_drain && s.retired == Some(task))
    }

    /// Register `task` in a free slot, unarmed.
    ///
    /// A one-shot whose fire is still unclaimed gets its old slot back, which
    /// invalidates that fire.
    ///
    /// # Errors
    ///
    /// [`TmError::Param`] for a null or already-registered task,
    /// [`TmError::QueueFull`] when no slot is free.
    pub fn insert(&mut self, task: TaskId, periodic: bool) -> TmResult<Ticket> {
        if task.is_null() {
            return Err(TmError::param("null task"));
        }
        if self.slot_of(task).is_some() {
            return Err(TmError::param(format!("{task} already registered")));
        }
        let slot = self
            .retired_slot_of(task)
            .or_else(|| self.free_slot())
            .ok_or(TmError::QueueFull {
                capacity: self.slots.len(),
            })?;

        let entry = &mut self.slots[slot];
        entry.owner = Some(task);
        entry.periodic = periodic;
        entry.deadline = 0;
        entry.period = 0;
        entry.heap_index = None;
        entry.pending_drain = false;
        entry.retired = None;
        let generation = entry.bump();
        Ok(ticket(slot, generation))
    }

    /// Free slot, preferring one without an unclaimed fire.
    fn free_slot(&self) -> Option<usize> {
        let mut fallback = None;
        for (slot, entry) in self.slots.iter().enumerate() {
            if entry.owner.is_none() {
                if !entry.pending_drain {
                    return Some(slot);
                }
                fallback.get_or_insert(slot);
            }
        }
        fallback
    }

    /// Arm `task` to fire `delay_us` after `now`. Re-priming an armed task
    /// replaces its deadline.
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is not registered.
    pub fn prime(&mut self, task: TaskId, delay_us: u64, now: u64) -> TmResult<Ticket> {
        let slot = self.registered_slot(task)?;
        self.heap.remove(&mut self.slots, slot);

        let entry = &mut self.slots[slot];
        entry.deadline = now.saturating_add(delay_us);
        entry.period = if entry.periodic { delay_us } else { 0 };
        entry.pending_drain = false;
        let generation = entry.bump();

        self.heap.push(&mut self.slots, slot);
        Ok(ticket(slot, generation))
    }

    /// Disarm and unregister `task`. Returns the microseconds that were left
    /// on its deadline, 0 if it was not armed.
    ///
    /// A one-shot that fired but was not yet drained has its fire discarded
    /// and reports 0.
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is neither registered nor holding
    /// an unclaimed fire.
    pub fn remove(&mut self, task: TaskId, now: u64) -> TmResult<u64> {
        let slot = match self.registered_slot(task) {
            Err(TmError::NotActive) => {
                let slot = self.retired_slot_of(task).ok_or(TmError::NotActive)?;
                let entry = &mut self.slots[slot];
                entry.pending_drain = false;
                entry.retired = None;
                entry.bump();
                return Ok(0);
            }
            other => other?,
        };
        let remaining = self.remaining_in(slot, now);
        self.heap.remove(&mut self.slots, slot);

        let entry = &mut self.slots[slot];
        entry.owner = None;
        entry.periodic = false;
        entry.period = 0;
        entry.pending_drain = false;
        entry.bump();
        Ok(remaining)
    }

    /// Alias of [`Scheduler::remove`].
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is not registered.
    pub fn cancel(&mut self, task: TaskId, now: u64) -> TmResult<u64> {
        self.remove(task, now)
    }

    /// Microseconds until `task` fires, 0 if due or unarmed.
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is not registered.
    pub fn time_remaining(&self, task: TaskId, now: u64) -> TmResult<u64> {
        let slot = self.registered_slot(task)?;
        Ok(self.remaining_in(slot, now))
    }

    fn remaining_in(&self, slot: usize, now: u64) -> u64 {
        let entry = &self.slots[slot];
        if entry.is_armed() {
            entry.deadline.saturating_sub(now)
        } else {
            0
        }
    }

    fn registered_slot(&self, task: TaskId) -> TmResult<usize> {
        if task.is_null() {
            return Err(TmError::param("null task"));
        }
        self.slot_of(task).ok_or(TmError::NotActive)
    }

    /// Pop every entry due at `now` and hand its ticket to `publish`.
    ///
    /// Periodic entries are rescheduled one period after their old deadline,
    /// or one period after `now` once they are `catch_up_limit` or more
    /// periods behind. One-shot entries free their slot.
    pub fn expire_due<F>(&mut self, now: u64, mut publish: F) -> ExpiryPass
    where
        F: FnMut(Ticket) -> bool,
    {
        let mut pass = ExpiryPass::default();

        while self
            .heap
            .min_deadline(&self.slots)
            .is_some_and(|deadline| deadline <= now)
        {
            let Some(slot) = self.heap.pop(&mut self.slots) else {
                break;
            };
            pass.expired += 1;

            let catch_up_limit = self.catch_up_limit;
            let entry = &mut self.slots[slot];
            entry.fired_deadline = entry.deadline;
            if entry.period > 0 {
                let behind = now - entry.deadline;
                let window = entry.period.saturating_mul(u64::from(catch_up_limit));
                entry.deadline = if behind >= window {
                    pass.clamped += 1;
                    now.saturating_add(entry.period)
                } else {
                    entry.deadline.saturating_add(entry.period)
                };
                let generation = entry.bump();
                entry.pending_drain = true;
                self.heap.push(&mut self.slots, slot);

                if publish(ticket(slot, generation)) {
                    pass.published += 1;
                } else {
                    pass.dropped += 1;
                }
            } else {
                entry.retired = entry.owner.take();
                entry.periodic = false;
                let generation = entry.bump();
                entry.pending_drain = true;

                if publish(ticket(slot, generation)) {
                    pass.published += 1;
                } else {
                    entry.pending_drain = false;
                    entry.retired = None;
                    pass.dropped += 1;
                }
            }
        }

        pass
    }

    /// Disarm and unregister every task, invalidating all published tickets.
    pub fn clear(&mut self) {
        while self.heap.pop(&mut self.slots).is_some() {}
        for entry in self.slots.iter_mut() {
            if entry.owner.take().is_some() || entry.pending_drain {
                entry.periodic = false;
                entry.period = 0;
                entry.pending_drain = false;
                entry.retired = None;
                entry.bump();
            }
        }
    }

    /// Validate a dequeued ticket against its slot.
    ///
    /// Returns the deadline the fire was due at when the generation still
    /// matches, and marks the fire as claimed.
    pub fn claim(&mut self, ticket: Ticket) -> Option<u64> {
        let entry = self.slots.get_mut(ticket.slot() as usize)?;
        if entry.generation != ticket.generation() {
            return None;
        }
        entry.pending_drain = false;
        entry.retired = None;
        Some(entry.fired_deadline)
    }

    /// Whether `ticket` still matches its slot.
    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.slots
            .get(ticket.slot() as usize)
            .is_some_and(|e| e.generation == ticket.generation())
    }

    /// Heap ordering and slot back-references are consistent.
    pub fn heap_is_valid(&self) -> bool {
        self.heap.is_valid(&self.slots)
            && self
                .slots
                .iter()
                .all(|e| e.heap_index.is_none() || e.owner.is_some())
    }
}

fn ticket(slot: usize, generation: u32) -> Ticket {
    // capacity is checked against u32 at construction
    #[allow(clippy::cast_possible_truncation)]
    Ticket::new(slot as u32, generation)
}
