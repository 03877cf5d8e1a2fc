// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscriber-side upstream connection.
//!
//! The long-lived half connects (and reconnects with backoff), sends the
//! handshake, and appends every received frame to the local queue; heartbeat
//! frames only refresh liveness. Repair requests from the reconciliation
//! engine are written onto the same socket out of band. Bootstrap
//! full-index fetches use a separate short-lived connection so the snapshot
//! does not interleave with the live stream.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::block::{
    next_sequence, Block, Handshake, RecordKind, RepairRequest, FRAME_LEN, INDEX_FETCH_POINTER,
};
use crate::config::UpstreamConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::queue::BlockQueue;
use crate::resilience::RetryConfig;
use crate::store::FileKey;
use crate::upstream::UpstreamRef;

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct UpstreamClient {
    config: UpstreamConfig,
    local_node: [u8; 4],
    queue: Arc<BlockQueue>,
    repair_tx: mpsc::Sender<RepairRequest>,
    repair_rx: Mutex<Option<mpsc::Receiver<RepairRequest>>>,
    retry: RetryConfig,
    failure_count: AtomicU64,
    last_success_ms: AtomicU64,
    /// Last upstream sequence received, so reconnects resume in place.
    last_received: AtomicU32,
}

impl UpstreamClient {
    pub fn new(
        config: UpstreamConfig,
        local_node: [u8; 4],
        queue: Arc<BlockQueue>,
    ) -> Arc<UpstreamClient> {
        Self::with_retry(config, local_node, queue, RetryConfig::daemon())
    }

    pub fn with_retry(
        config: UpstreamConfig,
        local_node: [u8; 4],
        queue: Arc<BlockQueue>,
        retry: RetryConfig,
    ) -> Arc<UpstreamClient> {
        let (repair_tx, repair_rx) = mpsc::channel(256);
        Arc::new(UpstreamClient {
            config,
            local_node,
            queue,
            repair_tx,
            repair_rx: Mutex::new(Some(repair_rx)),
            retry,
            failure_count: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
            last_received: AtomicU32::new(0),
        })
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn millis_since_success(&self) -> Option<u64> {
        let last = self.last_success_ms.load(Ordering::Acquire);
        if last == 0 {
            None
        } else {
            Some(epoch_millis().saturating_sub(last))
        }
    }

    fn handshake(&self) -> Handshake {
        let last = self.last_received.load(Ordering::Acquire);
        let requested = if last == 0 {
            0
        } else {
            next_sequence(last) as i32
        };
        let mut tag = *b"          ";
        for (dst, src) in tag.iter_mut().zip(self.config.subscriber_tag.bytes()) {
            *dst = src;
        }
        Handshake {
            requested_sequence: requested,
            playback: self.config.playback,
            subscriber_tag: tag,
            node: self.local_node,
        }
    }

    /// Reconnect loop; runs until shutdown. Spawned by the coordinator.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut repair_rx = {
            let mut guard = self
                .repair_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.take() {
                Some(rx) => rx,
                None => {
                    warn!("upstream client already running, refusing a second task");
                    return;
                }
            }
        };

        let span = info_span!("upstream", addr = %self.config.addr);
        async {
            let mut attempt: u32 = 0;
            loop {
                if *shutdown.borrow() {
                    return;
                }
                attempt += 1;
                let delay = self.retry.delay_for_attempt(attempt);
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => continue,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if attempt > 1 {
                    metrics::record_upstream_reconnect();
                }

                let stream = match timeout(
                    self.config.connect_timeout(),
                    TcpStream::connect(&self.config.addr),
                )
                .await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        self.failure_count.fetch_add(1, Ordering::AcqRel);
                        warn!(error = %e, attempt, "upstream connect failed");
                        continue;
                    }
                    Err(_) => {
                        self.failure_count.fetch_add(1, Ordering::AcqRel);
                        warn!(attempt, "upstream connect timed out");
                        continue;
                    }
                };

                match self
                    .run_connection(stream, &mut repair_rx, &mut shutdown)
                    .await
                {
                    Ok(()) => return, // shutdown
                    Err(e) => {
                        self.failure_count.fetch_add(1, Ordering::AcqRel);
                        warn!(error = %e, "upstream connection lost");
                        attempt = 0; // connection worked once, restart the schedule
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_connection(
        &self,
        stream: TcpStream,
        repair_rx: &mut mpsc::Receiver<RepairRequest>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let (reader, mut writer) = stream.into_split();

        let mut buf = BytesMut::new();
        self.handshake().encode(&mut buf);
        writer
            .write_all(&buf)
            .await
            .map_err(|e| ReplicationError::io("handshake write", e))?;
        info!(
            requested = self.handshake().requested_sequence,
            playback = self.config.playback,
            "subscribed to upstream"
        );

        // the read half runs on its own task so a blocked read never delays
        // repair writes, and socket close cancels it immediately
        let queue = self.queue.clone();
        let mut read_task: tokio::task::JoinHandle<(u32, Result<()>)> = tokio::spawn(async move {
            let mut reader = reader;
            let mut frame = vec![0u8; FRAME_LEN];
            let mut received: u32 = 0;
            loop {
                if let Err(e) = reader.read_exact(&mut frame).await {
                    return (received, Err(ReplicationError::io("frame read", e)));
                }
                let block = match Block::decode(&frame) {
                    Ok(block) => block,
                    Err(e) => return (received, Err(e)),
                };
                received = block.envelope.sequence;
                if block.kind() == RecordKind::Heartbeat {
                    continue;
                }
                queue.append(block);
                metrics::record_blocks_appended(1);
            }
        });

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                outcome = &mut read_task => {
                    let err = match outcome {
                        Ok((received, Err(e))) => {
                            if received != 0 {
                                self.last_received.store(received, Ordering::Release);
                            }
                            e
                        }
                        Ok((_, Ok(()))) => ReplicationError::internal("read task ended without error"),
                        Err(join) => ReplicationError::internal(format!("read task panicked: {join}")),
                    };
                    break Err(err);
                }
                maybe = repair_rx.recv() => {
                    match maybe {
                        Some(request) => {
                            buf.clear();
                            request.encode(&mut buf);
                            if let Err(e) = writer.write_all(&buf).await {
                                break Err(ReplicationError::io("repair write", e));
                            }
                            self.last_success_ms.store(epoch_millis(), Ordering::Release);
                        }
                        None => break Err(ReplicationError::internal("repair channel closed")),
                    }
                }
            }
        };
        read_task.abort();
        self.last_success_ms.store(epoch_millis(), Ordering::Release);
        result
    }

    /// One-shot snapshot connection: handshake at the head (no backlog),
    /// ask for the index, collect index frames until the control end marker.
    async fn fetch_index_snapshot(&self, key: FileKey) -> Result<Vec<Block>> {
        let stream = timeout(
            self.config.connect_timeout(),
            TcpStream::connect(&self.config.addr),
        )
        .await
        .map_err(|_| ReplicationError::bootstrap(key.to_string(), "connect timed out"))?
        .map_err(|e| ReplicationError::io("bootstrap connect", e))?;
        let (mut reader, mut writer) = stream.into_split();

        let mut buf = BytesMut::new();
        Handshake {
            requested_sequence: 0,
            playback: false,
            subscriber_tag: *b"BOOTSTRAP ",
            node: self.local_node,
        }
        .encode(&mut buf);
        RepairRequest {
            julian_day: key.julian_day,
            node: key.node,
            start_block: 0,
            end_block: 0,
            index_pointer: INDEX_FETCH_POINTER,
            extent_index: 0,
        }
        .encode(&mut buf);
        writer
            .write_all(&buf)
            .await
            .map_err(|e| ReplicationError::io("bootstrap write", e))?;

        let mut frame = vec![0u8; FRAME_LEN];
        let mut out = Vec::new();
        loop {
            reader
                .read_exact(&mut frame)
                .await
                .map_err(|e| ReplicationError::io("bootstrap read", e))?;
            let block = Block::decode(&frame)?;
            match block.kind() {
                RecordKind::Control => break,
                RecordKind::Index
                    if block.envelope.julian_day == key.julian_day
                        && block.envelope.source_node == key.node =>
                {
                    out.push(block)
                }
                // live blocks from the head may interleave; not ours to keep
                _ => continue,
            }
        }
        Ok(out)
    }
}

impl UpstreamRef for UpstreamClient {
    fn fetch_full_index(&self, key: FileKey) -> BoxFuture<'_, Result<Vec<Block>>> {
        Box::pin(self.fetch_index_snapshot(key))
    }

    fn send_repair(&self, request: RepairRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            metrics::record_repair_request_issued();
            self.repair_tx
                .send(request)
                .await
                .map_err(|_| ReplicationError::Shutdown)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    fn config() -> UpstreamConfig {
        UpstreamConfig {
            addr: "127.0.0.1:1".to_string(),
            subscriber_tag: "TEST".to_string(),
            playback: true,
            connect_timeout: "100ms".to_string(),
        }
    }

    #[test]
    fn handshake_resumes_after_the_last_received_sequence() {
        let queue = Arc::new(BlockQueue::new(16));
        let client = UpstreamClient::new(config(), *b"RX01", queue);
        assert_eq!(client.handshake().requested_sequence, 0);
        assert!(client.handshake().playback);
        assert_eq!(client.handshake().subscriber_tag, *b"TEST      ");

        client.last_received.store(41, Ordering::Release);
        assert_eq!(client.handshake().requested_sequence, 42);
    }

    #[test]
    fn health_accessors_start_empty() {
        let queue = Arc::new(BlockQueue::new(16));
        let client = UpstreamClient::new(config(), *b"RX01", queue);
        assert_eq!(client.failure_count(), 0);
        assert!(client.millis_since_success().is_none());
    }

    #[tokio::test]
    async fn connect_failure_counts_against_health() {
        let queue = Arc::new(BlockQueue::new(16));
        let client = UpstreamClient::with_retry(
            config(),
            *b"RX01",
            queue,
            RetryConfig {
                max_attempts: 1,
                ..RetryConfig::for_testing()
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(client.clone().run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        let _ = handle.await;
        assert!(client.failure_count() >= 1);
    }
}
