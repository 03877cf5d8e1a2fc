// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap reconciliation engine.
//!
//! One worker per open index file compares the intended state (index region)
//! against what actually landed (check region) and turns the difference into
//! rate-limited repair requests toward upstream. Workers adapt their cadence:
//! a file that just showed gaps is rescanned on the active interval, a quiet
//! file drops to the slow interval. The open chain tail's last extent is
//! churning by definition, so it only enters the comparison on every Nth
//! pass. Repair issuance is suspended globally while the queue is under
//! pressure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ReconcileConfig;
use crate::error::Result;
use crate::metrics;
use crate::resilience::RateLimiter;
use crate::state::SharedState;
use crate::store::{in_retention, today_julian, FileKey, FileStore, GapRecord, IndexBlockRecord, IndexFile};
use crate::upstream::UpstreamRef;

/// How often the manager reconciles its worker set with the store's open
/// files.
const WORKER_SYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct ReconcileManager {
    store: Arc<FileStore>,
    shared: Arc<SharedState>,
    upstream: Arc<dyn UpstreamRef>,
    config: ReconcileConfig,
    limiter: Arc<RateLimiter>,
    retention_days: i32,
}

impl ReconcileManager {
    pub fn new(
        store: Arc<FileStore>,
        shared: Arc<SharedState>,
        upstream: Arc<dyn UpstreamRef>,
        config: ReconcileConfig,
        retention_days: i32,
    ) -> Arc<ReconcileManager> {
        let limiter = Arc::new(RateLimiter::new(config.requests_per_second));
        Arc::new(ReconcileManager {
            store,
            shared,
            upstream,
            config,
            limiter,
            retention_days,
        })
    }

    /// Keep one worker per open file until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("reconcile");
        async {
            let mut workers: HashMap<FileKey, JoinHandle<()>> = HashMap::new();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(WORKER_SYNC_INTERVAL) => {}
                }

                workers.retain(|_, handle| !handle.is_finished());
                let open: HashSet<FileKey> = self.store.open_keys().into_iter().collect();
                workers.retain(|key, handle| {
                    if open.contains(key) {
                        true
                    } else {
                        debug!(file = %key, "file closed, stopping its worker");
                        handle.abort();
                        false
                    }
                });
                for key in open {
                    if !workers.contains_key(&key) {
                        let worker = self.clone();
                        let rx = shutdown.clone();
                        let handle = tokio::spawn(
                            async move { worker.reconcile_file(key, rx).await }
                                .instrument(info_span!("reconcile_file", file = %key)),
                        );
                        workers.insert(key, handle);
                    }
                }
            }
            info!(workers = workers.len(), "reconciliation stopping");
            for handle in workers.into_values() {
                handle.abort();
            }
        }
        .instrument(span)
        .await
    }

    async fn reconcile_file(&self, key: FileKey, mut shutdown: watch::Receiver<bool>) {
        let mut pass: u64 = 0;
        let mut active = true;
        let mut last_rebootstrap: Option<Instant> = None;
        // closed, fully-verified index blocks never change again
        let mut settled: HashSet<u32> = HashSet::new();

        loop {
            if !in_retention(key.julian_day, today_julian(), self.retention_days) {
                debug!(file = %key, "aged out of retention, worker exiting");
                return;
            }
            let Some(file) = self.store.get(key) else {
                return;
            };

            pass += 1;
            let every = u64::from(self.config.check_last_extent_every.max(1));
            let full_check = every == 1 || pass % every == 1;
            let started = Instant::now();
            match self.run_pass(&file, full_check, &mut settled) {
                Ok(gaps) => {
                    metrics::record_reconcile_pass(started.elapsed(), gaps.len());
                    active = !gaps.is_empty();
                    if active {
                        info!(file = %key, gaps = gaps.len(), "reconciliation found gaps");
                    }
                    if self.shared.block_requests() {
                        metrics::record_repair_requests_suppressed(gaps.len() as u64);
                        debug!(file = %key, "queue under pressure, repairs suppressed");
                    } else {
                        for gap in gaps {
                            tokio::select! {
                                biased;
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        return;
                                    }
                                }
                                _ = self.limiter.acquire() => {}
                            }
                            self.issue_repair(&gap).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(file = %key, error = %e, "reconciliation pass failed");
                    active = true;
                }
            }

            if let Err(e) = self.check_corruption(&file, &mut last_rebootstrap).await {
                warn!(file = %key, error = %e, "corruption check failed");
            }

            let wait = if active {
                self.config.active_interval()
            } else {
                self.config.quiet_interval()
            };
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One comparison of the full index chain; returns the coalesced gaps.
    fn run_pass(
        &self,
        file: &IndexFile,
        full_check: bool,
        settled: &mut HashSet<u32>,
    ) -> Result<Vec<GapRecord>> {
        let allocated = file.allocated_index_blocks()?;
        let mut gaps = Vec::new();
        for pointer in 0..allocated {
            if settled.contains(&pointer) {
                continue;
            }
            let scan = file.scan_block(pointer, full_check)?;
            let closed = file
                .read_index_block(pointer)?
                .map(|record| !record.is_open())
                .unwrap_or(false);
            if scan.satisfied && closed {
                settled.insert(pointer);
            }
            gaps.extend(scan.gaps);
        }
        Ok(gaps)
    }

    async fn issue_repair(&self, gap: &GapRecord) {
        let request = gap.to_repair_request();
        debug!(
            file = %FileKey { julian_day: gap.julian_day, node: gap.node },
            start = gap.start_block,
            end = gap.end_block,
            "requesting repair"
        );
        if let Err(e) = self.upstream.send_repair(request).await {
            warn!(error = %e, "repair request not delivered");
        }
    }

    /// Two open chain tails for one channel mean the index is inconsistent
    /// with itself; rebuild it from upstream, at most once per throttle
    /// window.
    async fn check_corruption(
        &self,
        file: &IndexFile,
        last_rebootstrap: &mut Option<Instant>,
    ) -> Result<()> {
        let Some(channel) = file.find_duplicate_open_channel()? else {
            return Ok(());
        };
        let key = file.key();
        warn!(
            file = %key,
            channel = %String::from_utf8_lossy(&channel).trim_end(),
            "duplicate open index chain detected"
        );
        metrics::record_corruption_detected();

        let throttle = self.config.rebootstrap_min_interval();
        if let Some(at) = *last_rebootstrap {
            if at.elapsed() < throttle {
                metrics::record_rebootstrap_throttled();
                return Ok(());
            }
        }
        *last_rebootstrap = Some(Instant::now());

        file.reset_index_region()?;
        let blocks = self.upstream.fetch_full_index(key).await?;
        let mut applied = 0usize;
        for block in &blocks {
            let pointer = block.envelope.index_pointer;
            if pointer < 0 {
                continue;
            }
            if let Some(record) = IndexBlockRecord::decode(&block.payload) {
                file.write_index_block(pointer as u32, &record)?;
                applied += 1;
            }
        }
        info!(file = %key, applied, "index rebuilt from upstream");
        metrics::record_bootstrap(applied);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, RepairRequest, PAYLOAD_LEN};
    use crate::store::Extent;
    use futures::future::BoxFuture;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingUpstream {
        repairs: Mutex<Vec<RepairRequest>>,
        index: Mutex<Vec<Block>>,
    }

    impl UpstreamRef for RecordingUpstream {
        fn fetch_full_index(&self, _key: FileKey) -> BoxFuture<'_, Result<Vec<Block>>> {
            let blocks = self.index.lock().unwrap().clone();
            Box::pin(async move { Ok(blocks) })
        }

        fn send_repair(&self, request: RepairRequest) -> BoxFuture<'_, Result<()>> {
            self.repairs.lock().unwrap().push(request);
            Box::pin(async { Ok(()) })
        }
    }

    fn manager_with(
        dir: &TempDir,
        upstream: Arc<RecordingUpstream>,
    ) -> (Arc<ReconcileManager>, Arc<FileStore>, Arc<SharedState>) {
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()).unwrap());
        let shared = Arc::new(SharedState::new());
        let config = crate::config::ReplicationConfig::for_testing(dir.path().to_path_buf());
        let manager = ReconcileManager::new(
            store.clone(),
            shared.clone(),
            upstream,
            config.settings.reconcile.clone(),
            365_000,
        );
        (manager, store, shared)
    }

    fn key() -> FileKey {
        FileKey {
            julian_day: today_julian(),
            node: *b"TN01",
        }
    }

    fn seed_gap(file: &IndexFile) {
        // intends blocks 64..=67 on a closed chain, only 64 and 67 landed
        let mut intended = IndexBlockRecord::new(*b"IUANMO BHZ00");
        intended.next_index = 0;
        intended.extents[0] = Extent {
            start_block: 64,
            bitmap: 0b1111,
        };
        file.write_index_block(0, &intended).unwrap();
        file.write_data_block(64, &[1u8; PAYLOAD_LEN]).unwrap();
        file.mark_check(0, 0, 64, &intended.channel).unwrap();
        file.write_data_block(67, &[1u8; PAYLOAD_LEN]).unwrap();
        file.mark_check(0, 0, 67, &intended.channel).unwrap();
    }

    #[tokio::test]
    async fn a_pass_turns_missing_bits_into_repair_requests() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(RecordingUpstream::default());
        let (manager, store, _) = manager_with(&dir, upstream.clone());
        let (file, _) = store.resolve(key()).unwrap();
        seed_gap(&file);

        let mut settled = HashSet::new();
        let gaps = manager.run_pass(&file, true, &mut settled).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_block, 65);
        assert_eq!(gaps[0].end_block, 66);

        for gap in &gaps {
            manager.issue_repair(gap).await;
        }
        let issued = upstream.repairs.lock().unwrap();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].start_block, 65);
        assert_eq!(issued[0].end_block, 66);
    }

    #[tokio::test]
    async fn satisfied_closed_blocks_settle_out_of_future_passes() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(RecordingUpstream::default());
        let (manager, store, _) = manager_with(&dir, upstream);
        let (file, _) = store.resolve(key()).unwrap();

        let mut intended = IndexBlockRecord::new(*b"IUANMO BHZ00");
        intended.next_index = 0;
        intended.extents[0] = Extent {
            start_block: 0,
            bitmap: 0b11,
        };
        file.write_index_block(0, &intended).unwrap();
        for bn in 0..2 {
            file.write_data_block(bn, &[1u8; PAYLOAD_LEN]).unwrap();
            file.mark_check(0, 0, bn, &intended.channel).unwrap();
        }

        let mut settled = HashSet::new();
        let gaps = manager.run_pass(&file, true, &mut settled).unwrap();
        assert!(gaps.is_empty());
        assert!(settled.contains(&0));
    }

    #[tokio::test]
    async fn open_tail_is_skipped_until_a_full_check() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(RecordingUpstream::default());
        let (manager, store, _) = manager_with(&dir, upstream);
        let (file, _) = store.resolve(key()).unwrap();

        // open tail, single extent, nothing landed yet
        let mut intended = IndexBlockRecord::new(*b"IUANMO BHZ00");
        intended.next_index = -1;
        intended.extents[0] = Extent {
            start_block: 0,
            bitmap: 0b111,
        };
        file.write_index_block(0, &intended).unwrap();

        let mut settled = HashSet::new();
        let gaps = manager.run_pass(&file, false, &mut settled).unwrap();
        assert!(gaps.is_empty());
        assert!(!settled.contains(&0));

        let gaps = manager.run_pass(&file, true, &mut settled).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_block, 0);
        assert_eq!(gaps[0].end_block, 2);
    }

    #[tokio::test]
    async fn duplicate_open_chains_trigger_a_throttled_rebuild() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(RecordingUpstream::default());
        let mut rebuilt = IndexBlockRecord::new(*b"IUANMO BHZ00");
        rebuilt.next_index = -1;
        rebuilt.extents[0] = Extent {
            start_block: 0,
            bitmap: 0b1,
        };
        upstream.index.lock().unwrap().push(Block::new(
            crate::block::BlockEnvelope {
                sequence: 1,
                julian_day: key().julian_day,
                source_node: *b"TN01",
                record_name: rebuilt.channel,
                block_number: -1,
                index_pointer: 0,
                extent_index: -1,
                continuation: false,
            },
            rebuilt.encode(),
        ));
        let (manager, store, _) = manager_with(&dir, upstream);
        let (file, _) = store.resolve(key()).unwrap();

        // two open tails for the same channel
        let mut a = IndexBlockRecord::new(*b"IUANMO BHZ00");
        a.next_index = -1;
        a.extents[0] = Extent {
            start_block: 0,
            bitmap: 0b1,
        };
        let mut b = a.clone();
        b.extents[0].start_block = 64;
        file.write_index_block(0, &a).unwrap();
        file.write_index_block(1, &b).unwrap();

        let mut last = None;
        manager.check_corruption(&file, &mut last).await.unwrap();
        assert!(last.is_some());
        assert_eq!(file.allocated_index_blocks().unwrap(), 1);
        assert_eq!(file.read_index_block(0).unwrap().unwrap(), rebuilt);

        // a second detection inside the throttle window leaves the file alone
        file.write_index_block(1, &b).unwrap();
        let before = last;
        manager.check_corruption(&file, &mut last).await.unwrap();
        assert_eq!(last, before);
    }

    #[tokio::test]
    async fn repairs_are_suppressed_while_the_queue_is_pressured() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(RecordingUpstream::default());
        let (manager, store, shared) = manager_with(&dir, upstream.clone());
        let (file, _) = store.resolve(key()).unwrap();
        seed_gap(&file);
        shared.update_queue_free(50);
        assert!(shared.block_requests());

        // drive one full worker pass with shutdown pre-armed so it exits
        let (tx, rx) = watch::channel(false);
        let worker = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconcile_file(key(), rx).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        worker.await.unwrap();

        assert!(upstream.repairs.lock().unwrap().is_empty());
    }
}
