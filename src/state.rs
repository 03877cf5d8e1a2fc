// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared replica state injected into every component.
//!
//! The materializer owns the inputs (queue free share, loss and remark
//! counts); the reconciliation engine reads the `block_requests` flag and
//! stops issuing repair traffic while it is set. Hysteresis on the flag:
//! set when the free share drops below 98%, cleared once it recovers to 99%.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tracing::{info, warn};

use crate::metrics;

const SUSPEND_BELOW_PCT_FREE: u32 = 98;
const RESUME_AT_PCT_FREE: u32 = 99;
const FULLNESS_STAGES: [u32; 4] = [60, 70, 80, 90];

#[derive(Default)]
pub struct SharedState {
    /// While set, the reconciliation engine must not issue repair requests.
    block_requests: AtomicBool,
    losses: AtomicU64,
    remarks: AtomicU64,
    /// Times the flag transitioned clear -> set.
    suspensions: AtomicU64,
    /// Highest fullness stage already alerted, cleared on drain.
    alerted_stage: AtomicU32,
}

impl SharedState {
    pub fn new() -> SharedState {
        SharedState::default()
    }

    pub fn block_requests(&self) -> bool {
        self.block_requests.load(Ordering::Acquire)
    }

    /// Feed the consumer cursor's current free share (0..=100). Drives the
    /// backpressure flag and the staged fullness alerts.
    pub fn update_queue_free(&self, pct_free: u32) {
        metrics::set_queue_free_pct(pct_free);

        if pct_free < SUSPEND_BELOW_PCT_FREE {
            if !self.block_requests.swap(true, Ordering::AcqRel) {
                self.suspensions.fetch_add(1, Ordering::AcqRel);
                warn!(pct_free, "queue filling, suspending repair requests");
                metrics::set_block_requests(true);
            }
        } else if pct_free >= RESUME_AT_PCT_FREE
            && self.block_requests.swap(false, Ordering::AcqRel)
        {
            info!(pct_free, "queue drained, resuming repair requests");
            metrics::set_block_requests(false);
        }

        let pct_used = 100 - pct_free;
        let stage = FULLNESS_STAGES
            .iter()
            .copied()
            .filter(|s| pct_used >= *s)
            .max()
            .unwrap_or(0);
        let prev = self.alerted_stage.load(Ordering::Acquire);
        if stage > prev {
            self.alerted_stage.store(stage, Ordering::Release);
            warn!(pct_used, stage, "queue fullness threshold crossed");
            metrics::record_fullness_alert(stage);
        } else if stage < prev {
            self.alerted_stage.store(stage, Ordering::Release);
        }
    }

    /// Count lost blocks for this replica's cursor; returns the new total.
    pub fn record_losses(&self, n: u64) -> u64 {
        metrics::record_blocks_lost(n);
        self.losses.fetch_add(n, Ordering::AcqRel) + n
    }

    pub fn losses(&self) -> u64 {
        self.losses.load(Ordering::Acquire)
    }

    /// Count a differing rewrite of an already-written offset.
    pub fn record_remark(&self) -> u64 {
        metrics::record_remark();
        self.remarks.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn remarks(&self) -> u64 {
        self.remarks.load(Ordering::Acquire)
    }

    /// How many times repairs have been suspended since startup.
    pub fn suspensions(&self) -> u64 {
        self.suspensions.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_sets_below_98_and_clears_at_99() {
        let s = SharedState::new();
        assert!(!s.block_requests());
        s.update_queue_free(97);
        assert!(s.block_requests());
        // 98 is inside the hysteresis band, flag holds
        s.update_queue_free(98);
        assert!(s.block_requests());
        s.update_queue_free(99);
        assert!(!s.block_requests());
        // one clear -> set transition in total
        assert_eq!(s.suspensions(), 1);
    }

    #[test]
    fn fullness_stages_alert_on_upward_edge_only() {
        let s = SharedState::new();
        s.update_queue_free(35); // 65% used, stage 60
        assert_eq!(s.alerted_stage.load(Ordering::Acquire), 60);
        s.update_queue_free(38); // still stage 60, no re-alert
        assert_eq!(s.alerted_stage.load(Ordering::Acquire), 60);
        s.update_queue_free(8); // 92% used, stage 90
        assert_eq!(s.alerted_stage.load(Ordering::Acquire), 90);
        s.update_queue_free(100); // drained, stage resets
        assert_eq!(s.alerted_stage.load(Ordering::Acquire), 0);
    }

    #[test]
    fn counters_accumulate() {
        let s = SharedState::new();
        assert_eq!(s.record_losses(3), 3);
        assert_eq!(s.record_losses(2), 5);
        assert_eq!(s.losses(), 5);
        assert_eq!(s.record_remark(), 1);
        assert_eq!(s.remarks(), 1);
    }
}
