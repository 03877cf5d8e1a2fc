// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reassembly of logical records split across fixed-size blocks.
//!
//! A buffer opens on the first non-continuation block of a channel, sized
//! from the record's self-declared total length. Continuation blocks fill a
//! completion bitmask; block numbers normally stay inside
//! `[first_block, first_block + total_blocks)`, but an extent allocation can
//! move mid-record, jumping the numbering to a new 64-aligned base. The
//! buffer re-anchors once for such a jump instead of rejecting the block.
//! Partial buffers idle past the abandonment timeout are dropped and logged,
//! never silently completed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::block::{declared_record_length, Block, PAYLOAD_LEN};
use crate::metrics;
use crate::store::EXTENT_BLOCKS;

/// A fully reassembled logical record, handed downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRecord {
    pub channel: [u8; 12],
    pub data: Vec<u8>,
}

struct AccreteBuffer {
    first_block: i32,
    total_blocks: usize,
    /// Sub-blocks covered before the re-anchor jump; equals `total_blocks`
    /// until a jump is seen.
    segment_one_len: usize,
    /// 64-aligned base the numbering resumed at, once re-anchored.
    resume_base: Option<i32>,
    mask: u64,
    data: Vec<u8>,
    last_update: Instant,
}

impl AccreteBuffer {
    fn new(first_block: i32, total_len: usize) -> AccreteBuffer {
        let total_blocks = total_len / PAYLOAD_LEN;
        AccreteBuffer {
            first_block,
            total_blocks,
            segment_one_len: total_blocks,
            resume_base: None,
            mask: 0,
            data: vec![0u8; total_len],
            last_update: Instant::now(),
        }
    }

    fn full_mask(&self) -> u64 {
        if self.total_blocks >= 64 {
            u64::MAX
        } else {
            (1u64 << self.total_blocks) - 1
        }
    }

    fn is_complete(&self) -> bool {
        self.mask == self.full_mask()
    }

    /// Map a block number to its position within the record, re-anchoring
    /// once when the numbering jumps to a fresh extent base.
    fn sub_index(&mut self, block_number: i32) -> Option<usize> {
        let seg1_end = self.first_block + self.segment_one_len as i32;
        if (self.first_block..seg1_end).contains(&block_number) {
            return Some((block_number - self.first_block) as usize);
        }
        if let Some(base) = self.resume_base {
            let remaining = (self.total_blocks - self.segment_one_len) as i32;
            if (base..base + remaining).contains(&block_number) {
                return Some(self.segment_one_len + (block_number - base) as usize);
            }
            return None;
        }
        // a jump lands exactly at a new extent base and only makes sense
        // while trailing sub-blocks are still unaccounted for
        if block_number >= 0
            && block_number as usize % EXTENT_BLOCKS == 0
            && block_number >= seg1_end
        {
            let boundary =
                self.first_block + (EXTENT_BLOCKS as i32 - self.first_block % EXTENT_BLOCKS as i32);
            let seg1 = (boundary - self.first_block) as usize;
            if seg1 < self.total_blocks {
                self.segment_one_len = seg1;
                self.resume_base = Some(block_number);
                return Some(seg1);
            }
        }
        None
    }

    fn accept(&mut self, block_number: i32, payload: &[u8; PAYLOAD_LEN]) -> bool {
        let Some(sub) = self.sub_index(block_number) else {
            return false;
        };
        self.data[sub * PAYLOAD_LEN..(sub + 1) * PAYLOAD_LEN].copy_from_slice(payload);
        self.mask |= 1u64 << sub;
        self.last_update = Instant::now();
        true
    }
}

/// Per-channel assembly pool. Single-owner, driven by the materializer.
pub struct AccretePool {
    buffers: HashMap<[u8; 12], AccreteBuffer>,
    abandon_after: Duration,
}

impl AccretePool {
    pub fn new(abandon_after: Duration) -> AccretePool {
        AccretePool {
            buffers: HashMap::new(),
            abandon_after,
        }
    }

    /// Feed one block; returns the reassembled record when it completes.
    pub fn offer(&mut self, channel: [u8; 12], block: &Block) -> Option<CompletedRecord> {
        let bn = block.envelope.block_number;
        if !block.envelope.continuation {
            if let Some(old) = self.buffers.remove(&channel) {
                if !old.is_complete() {
                    warn!(
                        channel = %String::from_utf8_lossy(&channel).trim_end(),
                        received = old.mask.count_ones(),
                        expected = old.total_blocks,
                        "new record started over a partial buffer, abandoning it"
                    );
                    metrics::record_accrete_abandoned();
                }
            }
            let Some(total_len) = declared_record_length(&block.payload) else {
                debug!(
                    channel = %String::from_utf8_lossy(&channel).trim_end(),
                    "record declares a length that is not a block multiple, discarded"
                );
                return None;
            };
            if total_len == PAYLOAD_LEN {
                // single-block record, nothing to accrete
                return Some(CompletedRecord {
                    channel,
                    data: block.payload.to_vec(),
                });
            }
            let mut buffer = AccreteBuffer::new(bn, total_len);
            buffer.accept(bn, &block.payload);
            self.buffers.insert(channel, buffer);
            return None;
        }

        let buffer = self.buffers.get_mut(&channel)?;
        if !buffer.accept(bn, &block.payload) {
            debug!(
                channel = %String::from_utf8_lossy(&channel).trim_end(),
                block_number = bn,
                first_block = buffer.first_block,
                "continuation outside the expected range, dropped"
            );
            return None;
        }
        if buffer.is_complete() {
            let buffer = self.buffers.remove(&channel)?;
            metrics::record_accrete_completed();
            return Some(CompletedRecord {
                channel,
                data: buffer.data,
            });
        }
        None
    }

    /// Drop partial buffers idle past the timeout; returns how many.
    pub fn sweep(&mut self) -> usize {
        let deadline = self.abandon_after;
        let before = self.buffers.len();
        self.buffers.retain(|channel, buffer| {
            let keep = buffer.last_update.elapsed() <= deadline;
            if !keep {
                warn!(
                    channel = %String::from_utf8_lossy(channel).trim_end(),
                    received = buffer.mask.count_ones(),
                    expected = buffer.total_blocks,
                    "abandoning idle partial record"
                );
                metrics::record_accrete_abandoned();
            }
            keep
        });
        before - self.buffers.len()
    }

    pub fn open_buffers(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockEnvelope;

    const CHANNEL: [u8; 12] = *b"IUANMO BHZ00";

    fn record_of(blocks: usize) -> Vec<u8> {
        let mut data = vec![0u8; blocks * PAYLOAD_LEN];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        // declared length in the fixed header of the first block
        data[30..32].copy_from_slice(&((blocks * PAYLOAD_LEN) as u16).to_be_bytes());
        data
    }

    fn block_for(record: &[u8], sub: usize, block_number: i32) -> Block {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&record[sub * PAYLOAD_LEN..(sub + 1) * PAYLOAD_LEN]);
        Block::new(
            BlockEnvelope {
                sequence: 1,
                julian_day: 2_460_916,
                source_node: *b"TN01",
                record_name: CHANNEL,
                block_number,
                index_pointer: 0,
                extent_index: 0,
                continuation: sub != 0,
            },
            payload,
        )
    }

    #[test]
    fn reassembles_in_order() {
        let mut pool = AccretePool::new(Duration::from_secs(600));
        let record = record_of(4);
        let first = 10;
        assert!(pool.offer(CHANNEL, &block_for(&record, 0, first)).is_none());
        assert!(pool.offer(CHANNEL, &block_for(&record, 1, 11)).is_none());
        assert!(pool.offer(CHANNEL, &block_for(&record, 2, 12)).is_none());
        let done = pool.offer(CHANNEL, &block_for(&record, 3, 13)).unwrap();
        assert_eq!(done.data, record);
        assert_eq!(pool.open_buffers(), 0);
    }

    #[test]
    fn reassembles_out_of_order() {
        let mut pool = AccretePool::new(Duration::from_secs(600));
        let record = record_of(4);
        assert!(pool.offer(CHANNEL, &block_for(&record, 0, 20)).is_none());
        assert!(pool.offer(CHANNEL, &block_for(&record, 3, 23)).is_none());
        assert!(pool.offer(CHANNEL, &block_for(&record, 1, 21)).is_none());
        let done = pool.offer(CHANNEL, &block_for(&record, 2, 22)).unwrap();
        assert_eq!(done.data, record);
    }

    #[test]
    fn reanchors_across_the_allocation_stride() {
        let mut pool = AccretePool::new(Duration::from_secs(600));
        let record = record_of(8);
        // blocks 60..64 in the first extent, then the allocation moves and
        // numbering resumes at 128
        for (sub, bn) in [(0, 60), (1, 61), (2, 62), (3, 63)] {
            assert!(pool.offer(CHANNEL, &block_for(&record, sub, bn)).is_none());
        }
        for (sub, bn) in [(4, 128), (5, 129), (6, 130)] {
            assert!(pool.offer(CHANNEL, &block_for(&record, sub, bn)).is_none());
        }
        let done = pool.offer(CHANNEL, &block_for(&record, 7, 131)).unwrap();
        assert_eq!(done.data, record);
    }

    #[test]
    fn rejects_blocks_outside_the_window() {
        let mut pool = AccretePool::new(Duration::from_secs(600));
        let record = record_of(4);
        pool.offer(CHANNEL, &block_for(&record, 0, 10));
        // 17 is neither in range nor a 64-aligned resume point
        assert!(pool.offer(CHANNEL, &block_for(&record, 1, 17)).is_none());
        assert_eq!(pool.open_buffers(), 1);
    }

    #[test]
    fn misaligned_declared_length_is_discarded() {
        let mut pool = AccretePool::new(Duration::from_secs(600));
        let mut record = record_of(4);
        record[30..32].copy_from_slice(&1000u16.to_be_bytes());
        assert!(pool.offer(CHANNEL, &block_for(&record, 0, 10)).is_none());
        assert_eq!(pool.open_buffers(), 0);
    }

    #[test]
    fn orphan_continuations_are_dropped() {
        let mut pool = AccretePool::new(Duration::from_secs(600));
        let record = record_of(4);
        assert!(pool.offer(CHANNEL, &block_for(&record, 2, 12)).is_none());
        assert_eq!(pool.open_buffers(), 0);
    }

    #[test]
    fn single_block_records_pass_straight_through() {
        let mut pool = AccretePool::new(Duration::from_secs(600));
        let record = record_of(1);
        let done = pool.offer(CHANNEL, &block_for(&record, 0, 5)).unwrap();
        assert_eq!(done.data, record);
        assert_eq!(pool.open_buffers(), 0);
    }

    #[test]
    fn idle_partials_are_abandoned_not_completed() {
        let mut pool = AccretePool::new(Duration::from_millis(10));
        let record = record_of(4);
        pool.offer(CHANNEL, &block_for(&record, 0, 10));
        pool.offer(CHANNEL, &block_for(&record, 1, 11));
        pool.offer(CHANNEL, &block_for(&record, 2, 12));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pool.sweep(), 1);
        assert_eq!(pool.open_buffers(), 0);
        // the late last block no longer completes anything
        assert!(pool.offer(CHANNEL, &block_for(&record, 3, 13)).is_none());
    }
}
