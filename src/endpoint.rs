// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming endpoint serving queue contents to remote subscribers.
//!
//! One session per connection: Handshake, then Streaming until the socket
//! errors or the liveness timer fires, then Closed. The write side streams
//! blocks in cursor order, emits a heartbeat sentinel after 15 s of silence,
//! and resynchronizes forward when the producer laps the session cursor.
//! The read side keeps consuming 28-byte repair requests and feeds served
//! blocks back onto the same stream, tagged out of band: subscribers must
//! not assume the main and repair streams share one order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::block::{
    Block, BlockEnvelope, Handshake, RepairRequest, HANDSHAKE_LEN, INDEX_FETCH_POINTER,
    REPAIR_REQUEST_LEN, SENTINEL_CONTROL, SENTINEL_REQUESTED,
};
use crate::block::looks_like_data_header;
use crate::config::EndpointConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::queue::BlockQueue;
use crate::resilience::Bulkhead;
use crate::store::{FileKey, FileStore};

/// How often the streaming loop re-checks an empty queue.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct StreamServer {
    queue: Arc<BlockQueue>,
    store: Arc<FileStore>,
    config: EndpointConfig,
    local_node: [u8; 4],
    sessions: Bulkhead,
}

impl StreamServer {
    pub fn new(
        queue: Arc<BlockQueue>,
        store: Arc<FileStore>,
        config: EndpointConfig,
        local_node: [u8; 4],
    ) -> StreamServer {
        let sessions = Bulkhead::new(config.max_sessions);
        StreamServer {
            queue,
            store,
            config,
            local_node,
            sessions,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self
            .config
            .bind_addr
            .clone()
            .ok_or_else(|| ReplicationError::Config("endpoint has no bind address".to_string()))?;
        TcpListener::bind(&addr)
            .await
            .map_err(|e| ReplicationError::io("endpoint bind", e))
    }

    /// Accept loop. Runs until the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("endpoint accept loop stopping");
                        return;
                    }
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let permit = match self.sessions.try_acquire() {
                        Ok(permit) => permit,
                        Err(full) => {
                            warn!(%peer, %full, "rejecting subscriber");
                            metrics::record_session_closed("bulkhead");
                            continue;
                        }
                    };
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    let span = info_span!("session", %peer);
                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            server.run_session(socket, shutdown).await;
                        }
                        .instrument(span),
                    );
                }
            }
        }
    }

    async fn run_session(&self, socket: TcpStream, shutdown: watch::Receiver<bool>) {
        metrics::record_session_opened();
        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let (mut reader, writer) = socket.into_split();

        let handshake = match timeout(
            self.config.idle_timeout(),
            read_handshake(&mut reader),
        )
        .await
        {
            Ok(Ok(hs)) => hs,
            Ok(Err(e)) => {
                warn!(error = %e, "handshake rejected");
                metrics::record_session_closed("handshake");
                return;
            }
            Err(_) => {
                warn!("handshake timed out");
                metrics::record_session_closed("handshake_timeout");
                return;
            }
        };

        let cursor = choose_start(&handshake, &self.queue, &self.config);
        info!(
            subscriber = %handshake.tag_lossy(),
            requested = handshake.requested_sequence,
            playback = handshake.playback,
            start = cursor,
            "subscriber connected"
        );

        // out-of-band repair reader; served blocks re-enter on the write side
        let (repair_tx, repair_rx) = mpsc::channel::<Block>(128);
        let store = self.store.clone();
        let max_blocks = self.config.max_repair_blocks;
        let reader_task = tokio::spawn(async move {
            run_repair_reader(reader, store, repair_tx, max_blocks).await;
        });

        let reason = self
            .stream_blocks(writer, cursor, repair_rx, shutdown)
            .await;
        reader_task.abort();
        info!(subscriber = %handshake.tag_lossy(), reason, "session closed");
        metrics::record_session_closed(reason);
    }

    /// The streaming half. Returns the close reason.
    async fn stream_blocks(
        &self,
        mut writer: OwnedWriteHalf,
        mut cursor: u32,
        mut repair_rx: mpsc::Receiver<Block>,
        mut shutdown: watch::Receiver<bool>,
    ) -> &'static str {
        let heartbeat = self.config.heartbeat_interval();
        let idle_timeout = self.config.idle_timeout();
        let mut buf = BytesMut::with_capacity(crate::block::FRAME_LEN);
        let mut last_sent = Instant::now();

        loop {
            if *shutdown.borrow() {
                return "shutdown";
            }

            if self.queue.is_lapped(cursor) {
                let jumped = self.queue.resync(self.config.lap_resync_pct);
                warn!(
                    from = cursor,
                    to = jumped,
                    "session cursor lapped, jumping forward"
                );
                metrics::record_session_lap_resync();
                cursor = jumped;
            }

            if let Some(mut block) = self.queue.get(cursor) {
                block.envelope.sequence = cursor;
                if self
                    .write_frame(&mut writer, &block, &mut buf, idle_timeout)
                    .await
                    .is_err()
                {
                    return "socket";
                }
                cursor = crate::block::next_sequence(cursor);
                last_sent = Instant::now();
                // interleave pending repair traffic while behind; a long
                // backlog must not starve the repair reader on its bounded
                // channel
                loop {
                    match repair_rx.try_recv() {
                        Ok(mut repair) => {
                            repair.envelope.sequence = cursor;
                            if self
                                .write_frame(&mut writer, &repair, &mut buf, idle_timeout)
                                .await
                                .is_err()
                            {
                                return "socket";
                            }
                            last_sent = Instant::now();
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => return "reader_gone",
                    }
                }
                continue;
            }

            if cursor != self.queue.next_sequence() {
                // behind but the slot is already recycled: loss for this
                // cursor, step past it
                cursor = crate::block::next_sequence(cursor);
                continue;
            }

            // caught up: wait for data, repair traffic, or the heartbeat
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                maybe = repair_rx.recv() => {
                    match maybe {
                        Some(mut block) => {
                            block.envelope.sequence = cursor;
                            if self
                                .write_frame(&mut writer, &block, &mut buf, idle_timeout)
                                .await
                                .is_err()
                            {
                                return "socket";
                            }
                            last_sent = Instant::now();
                        }
                        None => return "reader_gone",
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if last_sent.elapsed() >= heartbeat {
                        let hb = Block::heartbeat(cursor, self.local_node);
                        if self
                            .write_frame(&mut writer, &hb, &mut buf, idle_timeout)
                            .await
                            .is_err()
                        {
                            return "socket";
                        }
                        metrics::record_heartbeat_sent();
                        last_sent = Instant::now();
                    }
                }
            }
        }
    }

    async fn write_frame(
        &self,
        writer: &mut OwnedWriteHalf,
        block: &Block,
        buf: &mut BytesMut,
        idle_timeout: Duration,
    ) -> Result<()> {
        buf.clear();
        block.encode(buf);
        // a peer that stops reading trips the liveness timer here
        match timeout(idle_timeout, writer.write_all(buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(error = %e, "subscriber write failed");
                Err(ReplicationError::io("subscriber write", e))
            }
            Err(_) => {
                warn!("subscriber unresponsive past liveness window");
                Err(ReplicationError::io(
                    "subscriber write",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "liveness timeout"),
                ))
            }
        }
    }
}

async fn read_handshake(reader: &mut OwnedReadHalf) -> Result<Handshake> {
    let mut raw = [0u8; HANDSHAKE_LEN];
    reader
        .read_exact(&mut raw)
        .await
        .map_err(|e| ReplicationError::io("handshake read", e))?;
    Handshake::decode(&raw)
}

/// Starting cursor per the handshake contract: an explicit positive request
/// is honored as-is; otherwise playback starts at the oldest retained
/// position (sequence 1, or the playback window when the queue has already
/// lapped it) and non-playback skips the backlog entirely.
fn choose_start(handshake: &Handshake, queue: &BlockQueue, config: &EndpointConfig) -> u32 {
    if handshake.requested_sequence > 0 {
        return handshake.requested_sequence as u32;
    }
    if handshake.playback {
        if queue.is_lapped(1) {
            queue.resync(config.playback_resync_pct)
        } else {
            1
        }
    } else {
        queue.next_sequence()
    }
}

async fn run_repair_reader(
    mut reader: OwnedReadHalf,
    store: Arc<FileStore>,
    repair_tx: mpsc::Sender<Block>,
    max_blocks: usize,
) {
    let mut raw = [0u8; REPAIR_REQUEST_LEN];
    loop {
        if let Err(e) = reader.read_exact(&mut raw).await {
            debug!(error = %e, "repair reader finished");
            return;
        }
        let request = match RepairRequest::decode(&raw) {
            Ok(request) => request,
            Err(e) => {
                // protocol violation: drop the whole connection
                warn!(error = %e, "malformed repair request, closing session");
                return;
            }
        };
        let blocks = if request.index_pointer == INDEX_FETCH_POINTER {
            serve_index_fetch(&store, &request)
        } else {
            serve_repair(&store, &request, max_blocks)
        };
        debug!(
            julian_day = request.julian_day,
            start = request.start_block,
            end = request.end_block,
            index_fetch = request.index_pointer == INDEX_FETCH_POINTER,
            served = blocks.len(),
            "repair request served"
        );
        metrics::record_repair_request_served(blocks.len());
        for block in blocks {
            if repair_tx.send(block).await.is_err() {
                return;
            }
        }
    }
}

/// Read the requested range back out of the addressed file. Missing files
/// are a graceful empty answer; implausible blocks (all zero or without a
/// data-shaped header) are skipped. The true channel name is not in the
/// envelope, so served blocks carry the placeholder sentinel and the
/// consumer cracks the name from the payload.
pub(crate) fn serve_repair(
    store: &FileStore,
    request: &RepairRequest,
    max_blocks: usize,
) -> Vec<Block> {
    let key = FileKey {
        julian_day: request.julian_day,
        node: request.node,
    };
    let file = match store.for_repair(key) {
        Ok(Some(file)) => file,
        Ok(None) => {
            debug!(file = %key, "repair request for an absent file");
            return Vec::new();
        }
        Err(e) => {
            warn!(file = %key, error = %e, "repair open failed");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for bn in request.start_block..=request.end_block {
        if out.len() >= max_blocks {
            break;
        }
        let payload = match file.read_data_block(bn as u32) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                warn!(file = %key, block = bn, error = %e, "repair read failed");
                break;
            }
        };
        if !looks_like_data_header(&payload) {
            continue;
        }
        out.push(Block::new(
            BlockEnvelope {
                sequence: 1, // assigned at send time
                julian_day: request.julian_day,
                source_node: request.node,
                record_name: SENTINEL_REQUESTED,
                block_number: bn,
                index_pointer: request.index_pointer,
                extent_index: request.extent_index,
                continuation: false,
            },
            payload,
        ));
    }
    out
}

/// Answer an index-fetch request: every allocated index block as an
/// index-kind frame (the 512-byte block image as payload, the pointer in
/// the envelope), closed by a control end marker so the subscriber knows
/// the snapshot is complete. An absent file answers with the marker alone.
pub(crate) fn serve_index_fetch(store: &FileStore, request: &RepairRequest) -> Vec<Block> {
    let key = FileKey {
        julian_day: request.julian_day,
        node: request.node,
    };
    let mut out = Vec::new();
    if let Ok(Some(file)) = store.for_repair(key) {
        let allocated = file.allocated_index_blocks().unwrap_or(0);
        for pointer in 0..allocated {
            let record = match file.read_index_block(pointer) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(file = %key, pointer, error = %e, "index fetch read failed");
                    break;
                }
            };
            out.push(Block::new(
                BlockEnvelope {
                    sequence: 1, // assigned at send time
                    julian_day: request.julian_day,
                    source_node: request.node,
                    record_name: record.channel,
                    block_number: -1,
                    index_pointer: pointer as i32,
                    extent_index: -1,
                    continuation: false,
                },
                record.encode(),
            ));
        }
    } else {
        debug!(file = %key, "index fetch for an absent file");
    }
    out.push(Block::new(
        BlockEnvelope {
            sequence: 1,
            julian_day: request.julian_day,
            source_node: request.node,
            record_name: SENTINEL_CONTROL,
            block_number: 0,
            index_pointer: -1,
            extent_index: -1,
            continuation: false,
        },
        [0u8; crate::block::PAYLOAD_LEN],
    ));
    out
}
