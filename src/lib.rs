// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # waverep
//!
//! A block replication engine for real-time waveform acquisition chains.
//!
//! ## Architecture
//!
//! Each node holds a fixed-capacity sequenced queue of 512-byte blocks.
//! Producers append; any number of downstream replicas subscribe over TCP
//! and materialize the stream into per-(day, node) index files:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             waverep node                             │
//! │                                                                      │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────────────────┐  │
//! │  │ BlockQueue │──►│ StreamServer │──►│ downstream subscribers     │  │
//! │  │ (ring)     │   │ (TCP frames) │   │ (each with own cursor)     │  │
//! │  └────────────┘   └──────────────┘   └────────────────────────────┘  │
//! │        │                                                             │
//! │        ▼                                                             │
//! │  ┌────────────┐   ┌─────────────────┐   ┌─────────────────────────┐  │
//! │  │ Consumer   │──►│ FileStore       │◄──│ ReconcileManager        │  │
//! │  │ (cursor)   │   │ (index files)   │   │ (gap scan + repairs)    │  │
//! │  └────────────┘   └─────────────────┘   └─────────────────────────┘  │
//! │        ▲                                           │                 │
//! │  ┌────────────────┐                                ▼                 │
//! │  │ UpstreamClient │◄───────────────── repair requests to upstream    │
//! │  └────────────────┘                                                  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Path Delivery
//!
//! 1. **Live stream**: subscribers tail the queue in sequence order, with
//!    heartbeats while idle and forward resynchronization when lapped.
//! 2. **Reconciliation**: each open index file is periodically compared
//!    against what actually landed; missing ranges come back out-of-band
//!    as repair requests over the same connection.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use waverep::{ReplicaEngine, ReplicationConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicationConfig::for_testing("/tmp/waverep".into());
//!     let engine = ReplicaEngine::new(config).expect("config");
//!     engine.start().await.expect("start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod accrete;
pub mod block;
pub mod client;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod resilience;
pub mod state;
pub mod store;
pub mod upstream;

// Re-exports for convenience
pub use accrete::{AccretePool, CompletedRecord};
pub use block::{Block, BlockEnvelope, Handshake, RecordKind, RepairRequest};
pub use client::UpstreamClient;
pub use config::{ReplicationConfig, ReplicationSettings, UpstreamConfig};
pub use coordinator::{EngineState, HealthCheck, ReplicaEngine};
pub use endpoint::StreamServer;
pub use error::{ReplicationError, Result};
pub use queue::BlockQueue;
pub use store::{FileKey, FileStore, GapRecord, IndexBlockRecord};
pub use upstream::{NoOpUpstream, UpstreamRef};
