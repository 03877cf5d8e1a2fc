// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The sequenced block queue via [`crate::queue::BlockQueue`]
//! - The streaming endpoint via [`crate::endpoint::StreamServer`]
//! - The materializer via [`crate::consumer::Consumer`]
//! - Gap reconciliation via [`crate::reconcile::ReconcileManager`]
//! - The optional upstream subscription via [`crate::client::UpstreamClient`]
//!
//! # Architecture
//!
//! The coordinator manages the full replica lifecycle:
//! 1. Opens the file store and binds the streaming endpoint
//! 2. Subscribes to the configured upstream node (when one is configured)
//! 3. Drains the queue into index files and reassembles logical records
//! 4. Runs continuous gap reconciliation against the upstream
//! 5. Handles graceful shutdown with task draining

mod types;

pub use types::{EngineState, HealthCheck, UpstreamHealth};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::accrete::CompletedRecord;
use crate::block::Block;
use crate::client::UpstreamClient;
use crate::config::ReplicationConfig;
use crate::consumer::Consumer;
use crate::endpoint::StreamServer;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::queue::BlockQueue;
use crate::reconcile::ReconcileManager;
use crate::state::SharedState;
use crate::store::FileStore;
use crate::upstream::{NoOpUpstream, UpstreamRef};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const RECORD_CHANNEL_DEPTH: usize = 256;

/// The main replica engine.
///
/// A node runs exactly one of these. Producers on the same node feed blocks
/// through [`append`](Self::append); downstream replicas subscribe to the
/// streaming endpoint; the engine itself subscribes upstream when
/// `config.upstream` is set.
pub struct ReplicaEngine {
    config: ReplicationConfig,
    queue: Arc<BlockQueue>,
    store: Arc<FileStore>,
    shared: Arc<SharedState>,

    /// Live upstream client, absent on head-of-chain nodes.
    client: Option<Arc<UpstreamClient>>,
    upstream: Arc<dyn UpstreamRef>,

    /// Engine state (broadcast to watchers).
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Reassembled logical records, handed to the embedding application.
    record_rx: std::sync::Mutex<Option<mpsc::Receiver<CompletedRecord>>>,
    record_tx: mpsc::Sender<CompletedRecord>,

    /// Bound endpoint address, available once started.
    endpoint_addr: std::sync::Mutex<Option<std::net::SocketAddr>>,

    task_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReplicaEngine {
    /// Create a new engine in `Created` state. Opens the file store but
    /// binds nothing and spawns nothing until [`start()`](Self::start).
    pub fn new(config: ReplicationConfig) -> Result<ReplicaEngine> {
        config.validate()?;

        let queue = Arc::new(BlockQueue::new(config.settings.queue.capacity));
        let store = Arc::new(FileStore::new(config.data_dir.clone())?);
        let shared = Arc::new(SharedState::new());

        let (client, upstream): (Option<Arc<UpstreamClient>>, Arc<dyn UpstreamRef>) =
            match &config.upstream {
                Some(up) => {
                    let client =
                        UpstreamClient::new(up.clone(), config.node_bytes(), queue.clone());
                    (Some(client.clone()), client)
                }
                None => (None, Arc::new(NoOpUpstream)),
            };

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL_DEPTH);

        Ok(ReplicaEngine {
            config,
            queue,
            store,
            shared,
            client,
            upstream,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            record_rx: std::sync::Mutex::new(Some(record_rx)),
            record_tx,
            endpoint_addr: std::sync::Mutex::new(None),
            task_handles: RwLock::new(Vec::new()),
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The queue, for producers that bypass [`append`](Self::append).
    pub fn queue(&self) -> &Arc<BlockQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Submit one block from a local producer. Returns the assigned
    /// sequence.
    pub fn append(&self, block: Block) -> u32 {
        metrics::record_blocks_appended(1);
        self.queue.append(block)
    }

    /// Take the stream of reassembled logical records. Yields `None` after
    /// the first call; there is a single consumer of this stream.
    pub fn take_records(&self) -> Option<mpsc::Receiver<CompletedRecord>> {
        self.record_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Address the streaming endpoint bound to, once running.
    pub fn endpoint_addr(&self) -> Option<std::net::SocketAddr> {
        *self
            .endpoint_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        HealthCheck {
            state,
            ready: state == EngineState::Running,
            queue_head: self.queue.head(),
            queue_pct_free: self.queue.pct_free(self.queue.next_sequence()),
            repairs_suspended: self.shared.block_requests(),
            losses: self.shared.losses(),
            remarks: self.shared.remarks(),
            open_files: self.store.open_keys().len(),
            upstream: self.client.as_ref().map(|c| UpstreamHealth {
                failure_count: c.failure_count(),
                millis_since_success: c.millis_since_success(),
            }),
        }
    }

    /// Start the replica engine.
    ///
    /// 1. Binds the streaming endpoint (when configured)
    /// 2. Spawns the upstream subscription (when configured)
    /// 3. Spawns the materializer and the reconciliation manager
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::invalid_state(
                "Created",
                self.state().to_string(),
            ));
        }

        info!(
            node = %self.config.local_node,
            data_dir = %self.config.data_dir.display(),
            queue_capacity = self.config.settings.queue.capacity,
            "starting replica engine"
        );
        self.set_state(EngineState::Connecting);

        let mut handles = Vec::new();

        if self.config.settings.endpoint.bind_addr.is_some() {
            let server = Arc::new(StreamServer::new(
                self.queue.clone(),
                self.store.clone(),
                self.config.settings.endpoint.clone(),
                self.config.node_bytes(),
            ));
            let listener = match server.bind().await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "endpoint bind failed");
                    self.set_state(EngineState::Failed);
                    return Err(e);
                }
            };
            match listener.local_addr() {
                Ok(addr) => {
                    info!(%addr, "streaming endpoint bound");
                    *self
                        .endpoint_addr
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(addr);
                }
                Err(e) => warn!(error = %e, "endpoint local address unavailable"),
            }
            handles.push(tokio::spawn(server.run(listener, self.shutdown_rx.clone())));
        } else {
            debug!("no endpoint configured, running consumer-only");
        }

        if let Some(client) = &self.client {
            handles.push(tokio::spawn(
                client.clone().run(self.shutdown_rx.clone()),
            ));
        }

        let consumer = Consumer::new(
            self.queue.clone(),
            self.store.clone(),
            self.shared.clone(),
            self.upstream.clone(),
            self.config.settings.consumer.clone(),
            self.config.settings.accrete.clone(),
            self.config.node_bytes(),
            self.config.retention_days,
            Some(self.record_tx.clone()),
        );
        handles.push(tokio::spawn(consumer.run(self.shutdown_rx.clone())));

        let reconciler = ReconcileManager::new(
            self.store.clone(),
            self.shared.clone(),
            self.upstream.clone(),
            self.config.settings.reconcile.clone(),
            self.config.retention_days,
        );
        handles.push(tokio::spawn(reconciler.run(self.shutdown_rx.clone())));

        self.task_handles.write().await.extend(handles);
        self.set_state(EngineState::Running);
        info!("replica engine running");
        Ok(())
    }

    /// Shutdown the engine gracefully.
    ///
    /// Signals every task, then waits for each with a bounded timeout so a
    /// wedged session cannot hold the process open.
    pub async fn shutdown(&self) {
        info!("shutting down replica engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "task panicked during shutdown"),
                Err(_) => warn!("task timed out during shutdown"),
            }
        }

        self.set_state(EngineState::Stopped);
        info!("replica engine stopped");
    }

    fn set_state(&self, state: EngineState) {
        metrics::set_engine_state(&state);
        let _ = self.state_tx.send(state);
    }
}
