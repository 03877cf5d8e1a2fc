// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded sequenced block queue.
//!
//! A fixed arena of slots with a single producer-assigned head sequence.
//! Consumers hold only an integer cursor (the next sequence they want) and
//! compare against the live head; they never hold references into slots, so
//! slot reuse on wraparound cannot dangle. `get` verifies the stored sequence
//! before returning a copy, which makes a stale slot indistinguishable from a
//! missing one: both are "not found" and the cursor must resynchronize.
//!
//! Producers never wait on consumers. A consumer that falls more than
//! `capacity` behind is lapped and jumps forward instead of reading stale
//! slots.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::block::{next_sequence, seq_back, seq_distance, Block};

pub struct BlockQueue {
    slots: Vec<RwLock<Option<Block>>>,
    capacity: u32,
    /// Last assigned sequence; 0 until the first append.
    head: AtomicU32,
    /// Total blocks ever appended, for clamping resync on a young queue.
    appended: AtomicU64,
}

impl BlockQueue {
    pub fn new(capacity: u32) -> BlockQueue {
        BlockQueue::with_initial_sequence(capacity, 0)
    }

    /// Start the sequence space at `head` instead of empty. Used when a
    /// restarted producer wants subscribers to keep their positions, and by
    /// tests exercising the wrap.
    pub fn with_initial_sequence(capacity: u32, head: u32) -> BlockQueue {
        assert!(capacity > 0, "queue capacity must be positive");
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(RwLock::new(None));
        }
        BlockQueue {
            slots,
            capacity,
            head: AtomicU32::new(head),
            appended: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Append under the single-producer discipline and return the assigned
    /// sequence. Never blocks on consumers.
    pub fn append(&self, mut block: Block) -> u32 {
        let head = self.head.load(Ordering::Acquire);
        let seq = if head == 0 { 1 } else { next_sequence(head) };
        block.envelope.sequence = seq;
        let slot = ((u64::from(seq) - 1) % u64::from(self.capacity)) as usize;
        match self.slots[slot].write() {
            Ok(mut guard) => *guard = Some(block),
            Err(poisoned) => *poisoned.into_inner() = Some(block),
        }
        self.head.store(seq, Ordering::Release);
        self.appended.fetch_add(1, Ordering::Relaxed);
        seq
    }

    /// Copy out the block at `sequence`. Defined iff the sequence is within
    /// the live window `(head - capacity, head]`; anything else is not found
    /// and the caller must treat it as loss for its cursor.
    pub fn get(&self, sequence: u32) -> Option<Block> {
        let head = self.head.load(Ordering::Acquire);
        if head == 0 || sequence == 0 {
            return None;
        }
        let dist = seq_distance(head, sequence);
        if dist >= u64::from(self.capacity) {
            return None;
        }
        let slot = ((u64::from(sequence) - 1) % u64::from(self.capacity)) as usize;
        let guard = match self.slots[slot].read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .filter(|b| b.envelope.sequence == sequence)
            .cloned()
    }

    /// The sequence the next append will receive.
    pub fn next_sequence(&self) -> u32 {
        let head = self.head.load(Ordering::Acquire);
        if head == 0 {
            1
        } else {
            next_sequence(head)
        }
    }

    /// Last assigned sequence, 0 while empty.
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// A cursor is lapped once the producer is more than `capacity` ahead of
    /// it. A caught-up cursor (pointing one past head) is never lapped.
    pub fn is_lapped(&self, cursor: u32) -> bool {
        let head = self.head.load(Ordering::Acquire);
        if head == 0 || cursor == self.next_sequence() {
            return false;
        }
        seq_distance(head, cursor) > u64::from(self.capacity)
    }

    /// Slots not yet consumed by this cursor. Zero for a lapped cursor.
    pub fn slots_free(&self, cursor: u32) -> u32 {
        let head = self.head.load(Ordering::Acquire);
        if head == 0 || cursor == next_sequence(head) {
            return self.capacity;
        }
        let pending = seq_distance(head, cursor).saturating_add(1);
        u64::from(self.capacity).saturating_sub(pending) as u32
    }

    /// Free share of the queue for this cursor, 0..=100.
    pub fn pct_free(&self, cursor: u32) -> u32 {
        self.slots_free(cursor) * 100 / self.capacity
    }

    /// New cursor `pct` percent of capacity behind head, clamped so a young
    /// queue never resynchronizes to a sequence that was never assigned.
    pub fn resync(&self, pct: u32) -> u32 {
        let head = self.head.load(Ordering::Acquire);
        if head == 0 {
            return 1;
        }
        let appended = self.appended.load(Ordering::Relaxed);
        let want = u64::from(self.capacity) * u64::from(pct) / 100;
        let back = want.min(appended.saturating_sub(1)).min(u64::from(self.capacity) - 1);
        seq_back(head, back as u32)
    }
}
