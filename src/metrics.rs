// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metric emission helpers.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one-liners and
//! every series shares the `waverep_` prefix. Installing a recorder is the
//! host process's concern.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::coordinator::EngineState;

pub fn record_blocks_appended(n: u64) {
    counter!("waverep_blocks_appended_total").increment(n);
}

pub fn record_blocks_materialized(n: u64) {
    counter!("waverep_blocks_materialized_total").increment(n);
}

pub fn record_blocks_rejected(reason: &'static str) {
    counter!("waverep_blocks_rejected_total", "reason" => reason).increment(1);
}

pub fn record_blocks_lost(n: u64) {
    counter!("waverep_blocks_lost_total").increment(n);
}

pub fn record_remark() {
    counter!("waverep_remarks_total").increment(1);
}

pub fn set_queue_free_pct(pct: u32) {
    gauge!("waverep_queue_free_pct").set(pct as f64);
}

pub fn set_block_requests(blocked: bool) {
    gauge!("waverep_block_requests_flag").set(if blocked { 1.0 } else { 0.0 });
}

pub fn record_fullness_alert(stage: u32) {
    counter!("waverep_fullness_alerts_total", "stage" => stage.to_string()).increment(1);
}

pub fn record_session_opened() {
    counter!("waverep_sessions_opened_total").increment(1);
}

pub fn record_session_closed(reason: &'static str) {
    counter!("waverep_sessions_closed_total", "reason" => reason).increment(1);
}

pub fn record_heartbeat_sent() {
    counter!("waverep_heartbeats_sent_total").increment(1);
}

pub fn record_session_lap_resync() {
    counter!("waverep_session_lap_resyncs_total").increment(1);
}

pub fn record_repair_request_served(blocks: usize) {
    counter!("waverep_repair_requests_served_total").increment(1);
    counter!("waverep_repair_blocks_served_total").increment(blocks as u64);
}

pub fn record_repair_request_issued() {
    counter!("waverep_repair_requests_issued_total").increment(1);
}

pub fn record_repair_requests_suppressed(n: u64) {
    counter!("waverep_repair_requests_suppressed_total").increment(n);
}

pub fn record_bootstrap(blocks: usize) {
    counter!("waverep_bootstraps_total").increment(1);
    counter!("waverep_bootstrap_blocks_total").increment(blocks as u64);
}

pub fn record_rebootstrap_throttled() {
    counter!("waverep_rebootstraps_throttled_total").increment(1);
}

pub fn record_corruption_detected() {
    counter!("waverep_corruption_detected_total").increment(1);
}

pub fn set_open_files(n: usize) {
    gauge!("waverep_open_files").set(n as f64);
}

pub fn record_file_closed(reason: &'static str) {
    counter!("waverep_files_closed_total", "reason" => reason).increment(1);
}

pub fn record_reconcile_pass(duration: Duration, gaps: usize) {
    histogram!("waverep_reconcile_pass_seconds").record(duration.as_secs_f64());
    counter!("waverep_gap_records_total").increment(gaps as u64);
}

pub fn record_accrete_completed() {
    counter!("waverep_accrete_completed_total").increment(1);
}

pub fn record_accrete_abandoned() {
    counter!("waverep_accrete_abandoned_total").increment(1);
}

pub fn record_upstream_reconnect() {
    counter!("waverep_upstream_reconnects_total").increment(1);
}

pub fn set_engine_state(state: &EngineState) {
    let value = match state {
        EngineState::Created => 0.0,
        EngineState::Connecting => 1.0,
        EngineState::Running => 2.0,
        EngineState::ShuttingDown => 3.0,
        EngineState::Stopped => 4.0,
        EngineState::Failed => 5.0,
    };
    gauge!("waverep_engine_state").set(value);
}
