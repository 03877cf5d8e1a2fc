// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream consumer / materializer.
//!
//! One task per replica drains the queue into per-(day, node) index files.
//! Unreadable sequences are counted as losses and skipped; a lapped cursor
//! resynchronizes forward in one jump. New files bootstrap their full index
//! from upstream before live application so the index is never reconstructed
//! from a partial live tail. Data writes follow the remark policy: identical
//! rewrites are benign, differing bytes are counted and overwritten, never
//! rejected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::accrete::{AccretePool, CompletedRecord};
use crate::block::{
    channel_from_payload, next_sequence, seq_distance, Block, RecordKind, SENTINEL_REQUESTED,
};
use crate::config::{AccreteConfig, ConsumerConfig};
use crate::error::Result;
use crate::metrics;
use crate::queue::BlockQueue;
use crate::state::SharedState;
use crate::store::{in_retention, today_julian, FileKey, FileStore, IndexBlockRecord, IndexFile};
use crate::upstream::UpstreamRef;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Blocks applied between free-share samples while draining a backlog.
const FLOW_SAMPLE_EVERY: u32 = 8;
/// Lapped consumers jump to this share of capacity behind head.
const LAP_RESYNC_PCT: u32 = 90;

pub struct Consumer {
    queue: Arc<BlockQueue>,
    store: Arc<FileStore>,
    shared: Arc<SharedState>,
    upstream: Arc<dyn UpstreamRef>,
    config: ConsumerConfig,
    accrete_config: AccreteConfig,
    local_node: [u8; 4],
    retention_days: i32,
    accrete: AccretePool,
    record_tx: Option<mpsc::Sender<CompletedRecord>>,
    cursor: u32,
    last_loss_alert: u64,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<BlockQueue>,
        store: Arc<FileStore>,
        shared: Arc<SharedState>,
        upstream: Arc<dyn UpstreamRef>,
        config: ConsumerConfig,
        accrete_config: AccreteConfig,
        local_node: [u8; 4],
        retention_days: i32,
        record_tx: Option<mpsc::Sender<CompletedRecord>>,
    ) -> Consumer {
        let cursor = queue.next_sequence();
        let accrete = AccretePool::new(accrete_config.abandon_after());
        Consumer {
            queue,
            store,
            shared,
            upstream,
            config,
            accrete_config,
            local_node,
            retention_days,
            accrete,
            record_tx,
            cursor,
            last_loss_alert: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("consumer");
        async {
            let mut maintenance = interval(self.config.maintenance_interval());
            maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sweep = interval(self.accrete_config.sweep_interval());
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut status = interval(self.config.status_interval());
            status.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("consumer stopping");
                            return;
                        }
                    }
                    _ = maintenance.tick() => self.maintenance(),
                    _ = sweep.tick() => {
                        self.accrete.sweep();
                    }
                    _ = status.tick() => self.log_status(),
                    _ = tokio::time::sleep(POLL_INTERVAL) => self.drain().await,
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Apply everything between the cursor and the queue head.
    pub(crate) async fn drain(&mut self) {
        if self.queue.is_lapped(self.cursor) {
            let head = self.queue.head();
            let jumped = self.queue.resync(LAP_RESYNC_PCT);
            let lost = seq_distance(head, self.cursor) - seq_distance(head, jumped);
            warn!(
                from = self.cursor,
                to = jumped,
                lost,
                "consumer cursor lapped, resynchronizing forward"
            );
            self.count_losses(lost);
            self.cursor = jumped;
        }

        // Sample the free share before and during the drain, not only at
        // catch-up; a busy consumer is exactly when the backpressure flag
        // and the fullness alerts must engage.
        self.shared.update_queue_free(self.queue.pct_free(self.cursor));
        let mut since_sample = 0u32;
        while self.cursor != self.queue.next_sequence() {
            match self.queue.get(self.cursor) {
                Some(block) => {
                    self.apply(block).await;
                }
                None => {
                    // slot recycled under us: a single-block loss
                    self.count_losses(1);
                }
            }
            self.cursor = next_sequence(self.cursor);
            since_sample += 1;
            if since_sample == FLOW_SAMPLE_EVERY {
                since_sample = 0;
                self.shared.update_queue_free(self.queue.pct_free(self.cursor));
            }
        }
        self.shared.update_queue_free(self.queue.pct_free(self.cursor));
    }

    fn count_losses(&mut self, n: u64) {
        if n == 0 {
            return;
        }
        let total = self.shared.record_losses(n);
        let every = self.config.loss_alert_every.max(1);
        if total / every > self.last_loss_alert / every {
            warn!(total_losses = total, "block loss threshold crossed");
        }
        self.last_loss_alert = total;
    }

    async fn apply(&mut self, block: Block) {
        match block.kind() {
            RecordKind::Heartbeat | RecordKind::Control => return,
            RecordKind::ForceLoad => {
                self.force_reload(&block).await;
                return;
            }
            _ => {}
        }

        let envelope = &block.envelope;
        let today = today_julian();
        if !in_retention(envelope.julian_day, today, self.retention_days) {
            debug!(
                julian_day = envelope.julian_day,
                "block outside retention window, dropped"
            );
            metrics::record_blocks_rejected("retention");
            return;
        }
        if envelope.source_node == self.local_node {
            metrics::record_blocks_rejected("self_node");
            return;
        }
        if !envelope.source_node.iter().all(|b| (0x21..0x7f).contains(b)) {
            metrics::record_blocks_rejected("malformed_node");
            return;
        }

        let key = FileKey {
            julian_day: envelope.julian_day,
            node: envelope.source_node,
        };
        let file = match self.store.resolve(key) {
            Ok((file, created)) => {
                if created {
                    self.bootstrap(&file).await;
                }
                file
            }
            Err(e) => {
                warn!(file = %key, error = %e, "cannot resolve index file");
                return;
            }
        };

        let outcome = match block.kind() {
            RecordKind::Data => {
                self.apply_data(&file, &block, block.envelope.record_name, true)
            }
            RecordKind::RepairPlaceholder => self.apply_repair(&file, &block),
            RecordKind::Index => self.apply_index(&file, &block),
            _ => Ok(()),
        };
        match outcome {
            Ok(()) => metrics::record_blocks_materialized(1),
            Err(e) => {
                warn!(file = %key, error = %e, "block not materialized");
                metrics::record_blocks_rejected("store_error");
            }
        }
    }

    fn apply_data(
        &mut self,
        file: &IndexFile,
        block: &Block,
        channel: [u8; 12],
        accrete: bool,
    ) -> Result<()> {
        let envelope = &block.envelope;
        // negative numbers mark disambiguated non-record content delivered
        // via the repair path; the magnitude is still the slot
        let block_number = envelope.block_number.unsigned_abs();
        let outcome = file.write_data_block(block_number, &block.payload)?;
        if outcome == crate::store::WriteOutcome::Conflict {
            let remarks = self.shared.record_remark();
            debug!(
                file = %file.key(),
                block_number,
                remarks,
                "differing rewrite, last writer wins"
            );
        }
        if envelope.index_pointer >= 0 && envelope.extent_index >= 0 {
            file.mark_check(
                envelope.index_pointer as u32,
                envelope.extent_index as u32,
                block_number,
                &channel,
            )?;
        }
        if accrete && channel != SENTINEL_REQUESTED {
            if let Some(done) = self.accrete.offer(channel, block) {
                self.hand_off(done);
            }
        }
        Ok(())
    }

    fn apply_repair(&mut self, file: &IndexFile, block: &Block) -> Result<()> {
        // recover the true channel from the payload, falling back to the
        // intended index block the repair request addressed
        let channel = channel_from_payload(&block.payload)
            .or_else(|| {
                let ptr = block.envelope.index_pointer;
                if ptr >= 0 {
                    file.read_index_block(ptr as u32)
                        .ok()
                        .flatten()
                        .map(|record| record.channel)
                } else {
                    None
                }
            })
            .unwrap_or(SENTINEL_REQUESTED);
        // re-delivered blocks never re-enter live reassembly
        self.apply_data(file, block, channel, false)
    }

    fn apply_index(&mut self, file: &IndexFile, block: &Block) -> Result<()> {
        let pointer = block.envelope.index_pointer;
        if pointer < 0 {
            metrics::record_blocks_rejected("malformed_index");
            return Ok(());
        }
        let Some(record) = IndexBlockRecord::decode(&block.payload) else {
            metrics::record_blocks_rejected("malformed_index");
            return Ok(());
        };
        file.write_index_block(pointer as u32, &record)
    }

    /// Fetch and apply the complete upstream index for a newly created file.
    async fn bootstrap(&self, file: &IndexFile) {
        let key = file.key();
        let fetched = timeout(
            self.config.bootstrap_timeout(),
            self.upstream.fetch_full_index(key),
        )
        .await;
        let blocks = match fetched {
            Ok(Ok(blocks)) => blocks,
            Ok(Err(e)) => {
                warn!(file = %key, error = %e, "bootstrap fetch failed, applying live stream only");
                return;
            }
            Err(_) => {
                warn!(file = %key, "bootstrap fetch timed out, applying live stream only");
                return;
            }
        };
        let mut applied = 0usize;
        for block in &blocks {
            let pointer = block.envelope.index_pointer;
            if pointer < 0 {
                continue;
            }
            let Some(record) = IndexBlockRecord::decode(&block.payload) else {
                continue;
            };
            match file.write_index_block(pointer as u32, &record) {
                Ok(()) => applied += 1,
                Err(e) => warn!(file = %key, pointer, error = %e, "bootstrap apply failed"),
            }
        }
        info!(file = %key, applied, "bootstrapped index from upstream");
        metrics::record_bootstrap(applied);
    }

    /// Operator-triggered full reload of the addressed file.
    async fn force_reload(&self, block: &Block) {
        let key = FileKey {
            julian_day: block.envelope.julian_day,
            node: block.envelope.source_node,
        };
        if !in_retention(key.julian_day, today_julian(), self.retention_days) {
            debug!(file = %key, "forced reload outside retention window, ignored");
            metrics::record_blocks_rejected("retention");
            return;
        }
        info!(file = %key, "forced index reload requested");
        match self.store.resolve(key) {
            Ok((file, _)) => {
                if let Err(e) = file.reset_index_region() {
                    warn!(file = %key, error = %e, "index reset failed");
                    return;
                }
                self.bootstrap(&file).await;
            }
            Err(e) => warn!(file = %key, error = %e, "forced reload cannot open file"),
        }
    }

    fn maintenance(&mut self) {
        let closed = self.store.maintenance(
            self.config.stale_close(),
            today_julian(),
            self.retention_days,
        );
        if !closed.is_empty() {
            info!(closed = closed.len(), "maintenance closed index files");
        }
    }

    fn log_status(&self) {
        info!(
            cursor = self.cursor,
            pct_free = self.queue.pct_free(self.cursor),
            losses = self.shared.losses(),
            remarks = self.shared.remarks(),
            open_files = self.store.open_keys().len(),
            open_accrete = self.accrete.open_buffers(),
            "replica status"
        );
    }

    fn hand_off(&self, record: CompletedRecord) {
        if let Some(tx) = &self.record_tx {
            if let Err(e) = tx.try_send(record) {
                debug!(error = %e, "downstream record channel full, record dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockEnvelope, PAYLOAD_LEN};
    use crate::store::{Extent, WriteOutcome};
    use crate::upstream::NoOpUpstream;
    use futures::future::BoxFuture;
    use tempfile::TempDir;

    struct FixtureUpstream {
        index: Vec<Block>,
    }

    impl UpstreamRef for FixtureUpstream {
        fn fetch_full_index(&self, _key: FileKey) -> BoxFuture<'_, Result<Vec<Block>>> {
            let blocks = self.index.clone();
            Box::pin(async move { Ok(blocks) })
        }

        fn send_repair(&self, _request: crate::block::RepairRequest) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn consumer_with(
        dir: &TempDir,
        upstream: Arc<dyn UpstreamRef>,
    ) -> (Consumer, Arc<BlockQueue>, Arc<FileStore>, Arc<SharedState>) {
        let queue = Arc::new(BlockQueue::new(32));
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()).unwrap());
        let shared = Arc::new(SharedState::new());
        let config = crate::config::ReplicationConfig::for_testing(dir.path().to_path_buf());
        let consumer = Consumer::new(
            queue.clone(),
            store.clone(),
            shared.clone(),
            upstream,
            config.settings.consumer.clone(),
            config.settings.accrete.clone(),
            *b"TST1",
            365_000, // effectively no retention limit for fixed test days
            None,
        );
        (consumer, queue, store, shared)
    }

    fn data_block(julian: i32, node: [u8; 4], bn: i32, fill: u8) -> Block {
        let mut payload = [fill.max(1); PAYLOAD_LEN];
        payload[..8].copy_from_slice(b"000001D ");
        Block::new(
            BlockEnvelope {
                sequence: 0,
                julian_day: julian,
                source_node: node,
                record_name: *b"IUANMO BHZ00",
                block_number: bn,
                index_pointer: 0,
                extent_index: 0,
                continuation: false,
            },
            payload,
        )
    }

    #[tokio::test]
    async fn drains_data_blocks_into_the_store() {
        let dir = TempDir::new().unwrap();
        let (mut consumer, queue, store, shared) =
            consumer_with(&dir, Arc::new(NoOpUpstream));
        let today = today_julian();
        for bn in 64..70 {
            queue.append(data_block(today, *b"TN01", bn, bn as u8));
        }
        consumer.drain().await;

        let key = FileKey {
            julian_day: today,
            node: *b"TN01",
        };
        let file = store.get(key).unwrap();
        assert!(file.read_data_block(64).unwrap().is_some());
        assert!(file.read_data_block(69).unwrap().is_some());
        // check ledger marked under pointer 0, extent 0
        let check = file.read_check_block(0).unwrap().unwrap();
        assert_eq!(check.extents[0].bitmap.count_ones(), 6);
        assert_eq!(shared.losses(), 0);
    }

    #[tokio::test]
    async fn rejects_own_node_and_expired_days() {
        let dir = TempDir::new().unwrap();
        let (mut consumer, queue, store, _) = consumer_with(&dir, Arc::new(NoOpUpstream));
        consumer.retention_days = 30;
        let today = today_julian();
        queue.append(data_block(today, *b"TST1", 1, 1)); // self
        queue.append(data_block(today - 400, *b"TN01", 1, 1)); // expired
        queue.append(data_block(today, *b"\0\0\0\0", 1, 1)); // malformed node
        consumer.drain().await;
        assert!(store.open_keys().is_empty());
    }

    #[tokio::test]
    async fn expired_force_loads_do_not_open_files() {
        let dir = TempDir::new().unwrap();
        let (mut consumer, queue, store, _) = consumer_with(&dir, Arc::new(NoOpUpstream));
        consumer.retention_days = 30;
        let mut block = data_block(today_julian() - 400, *b"TN01", 0, 1);
        block.envelope.record_name = crate::block::SENTINEL_FORCE_LOAD;
        queue.append(block);
        consumer.drain().await;
        assert!(store.open_keys().is_empty());
    }

    #[tokio::test]
    async fn identical_redelivery_is_not_a_remark() {
        let dir = TempDir::new().unwrap();
        let (mut consumer, queue, _, shared) = consumer_with(&dir, Arc::new(NoOpUpstream));
        let today = today_julian();
        queue.append(data_block(today, *b"TN01", 5, 9));
        queue.append(data_block(today, *b"TN01", 5, 9)); // identical
        consumer.drain().await;
        assert_eq!(shared.remarks(), 0);

        queue.append(data_block(today, *b"TN01", 5, 13)); // differing
        consumer.drain().await;
        assert_eq!(shared.remarks(), 1);
    }

    #[tokio::test]
    async fn new_files_bootstrap_from_upstream() {
        let dir = TempDir::new().unwrap();
        let today = today_julian();
        let mut record = IndexBlockRecord::new(*b"IUANMO BHZ00");
        record.extents[0] = Extent {
            start_block: 0,
            bitmap: 0b1010,
        };
        let index_frame = Block::new(
            BlockEnvelope {
                sequence: 1,
                julian_day: today,
                source_node: *b"TN01",
                record_name: record.channel,
                block_number: -1,
                index_pointer: 3,
                extent_index: -1,
                continuation: false,
            },
            record.encode(),
        );
        let upstream = Arc::new(FixtureUpstream {
            index: vec![index_frame],
        });
        let (mut consumer, queue, store, _) = consumer_with(&dir, upstream);

        queue.append(data_block(today, *b"TN01", 0, 1));
        consumer.drain().await;

        let key = FileKey {
            julian_day: today,
            node: *b"TN01",
        };
        let file = store.get(key).unwrap();
        assert_eq!(file.read_index_block(3).unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn repair_blocks_recover_their_channel_from_the_payload() {
        let dir = TempDir::new().unwrap();
        let (mut consumer, queue, store, _) = consumer_with(&dir, Arc::new(NoOpUpstream));
        let today = today_julian();

        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..8].copy_from_slice(b"000001D ");
        payload[8..13].copy_from_slice(b"ANMO ");
        payload[13..15].copy_from_slice(b"00");
        payload[15..18].copy_from_slice(b"BHZ");
        payload[18..20].copy_from_slice(b"IU");
        queue.append(Block::new(
            BlockEnvelope {
                sequence: 0,
                julian_day: today,
                source_node: *b"TN01",
                record_name: SENTINEL_REQUESTED,
                block_number: 7,
                index_pointer: 2,
                extent_index: 0,
                continuation: false,
            },
            payload,
        ));
        consumer.drain().await;

        let key = FileKey {
            julian_day: today,
            node: *b"TN01",
        };
        let file = store.get(key).unwrap();
        assert!(file.read_data_block(7).unwrap().is_some());
        let check = file.read_check_block(2).unwrap().unwrap();
        assert_eq!(check.channel, *b"IUANMO BHZ00");
    }

    #[tokio::test]
    async fn deep_backlog_suspends_repairs_until_drained() {
        let dir = TempDir::new().unwrap();
        let (mut consumer, queue, _, shared) = consumer_with(&dir, Arc::new(NoOpUpstream));
        let today = today_julian();
        // fill the 32-slot queue to the brink without lapping the cursor
        for bn in 0..31 {
            queue.append(data_block(today, *b"TN01", bn, 1));
        }
        assert!(queue.pct_free(consumer.cursor) < 10);
        assert!(!shared.block_requests());

        consumer.drain().await;

        // the drain itself raised the flag, then cleared it at catch-up
        assert_eq!(shared.suspensions(), 1);
        assert!(!shared.block_requests());
    }

    #[tokio::test]
    async fn recycled_slots_count_as_losses() {
        let dir = TempDir::new().unwrap();
        let (mut consumer, queue, _, shared) = consumer_with(&dir, Arc::new(NoOpUpstream));
        let today = today_julian();
        // overrun the 32-slot queue without draining
        for bn in 0..100 {
            queue.append(data_block(today, *b"TN01", bn, 1));
        }
        consumer.drain().await;
        assert!(shared.losses() > 0);
        // cursor caught up afterwards
        assert_eq!(consumer.cursor, queue.next_sequence());
    }

    #[tokio::test]
    async fn index_frames_land_in_the_index_region() {
        let dir = TempDir::new().unwrap();
        let (mut consumer, queue, store, _) = consumer_with(&dir, Arc::new(NoOpUpstream));
        let today = today_julian();
        let mut record = IndexBlockRecord::new(*b"IUANMO BHZ00");
        record.extents[1] = Extent {
            start_block: 64,
            bitmap: 0xFF,
        };
        queue.append(Block::new(
            BlockEnvelope {
                sequence: 0,
                julian_day: today,
                source_node: *b"TN01",
                record_name: record.channel,
                block_number: -1,
                index_pointer: 5,
                extent_index: -1,
                continuation: false,
            },
            record.encode(),
        ));
        consumer.drain().await;

        let key = FileKey {
            julian_day: today,
            node: *b"TN01",
        };
        let file = store.get(key).unwrap();
        assert_eq!(file.read_index_block(5).unwrap().unwrap(), record);
        assert_eq!(
            file.write_data_block(64, &[1u8; PAYLOAD_LEN]).unwrap(),
            WriteOutcome::Fresh
        );
    }
}
