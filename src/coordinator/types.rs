// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! Defines the state machine for the replica engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!    │                              │
//!    │ (never started)              │ (endpoint bound, tasks up)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!                              │
//!                    (unrecoverable error)
//!                              ↓
//!                           Failed
//! ```
//!
//! Out-of-memory during startup or steady state is treated as fatal; the
//! process terminates rather than limping along with a partial engine.

/// State of the replica engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicaEngine::start) to begin.
    Created,

    /// `start()` in progress: binding the endpoint, spawning tasks.
    Connecting,

    /// Normal operation. The endpoint is serving subscribers, the consumer
    /// is materializing and the reconciler is scanning for gaps.
    Running,

    /// `shutdown()` called; tasks are draining.
    ShuttingDown,

    /// Graceful shutdown complete. Safe to drop.
    Stopped,

    /// Failed to start or unrecoverable error. Check logs for details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Snapshot for monitoring endpoints. No I/O; everything comes from cached
/// atomics and registries.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and accepting work.
    pub ready: bool,
    pub queue_head: u32,
    pub queue_pct_free: u32,
    /// Repair issuance currently suspended by queue pressure.
    pub repairs_suspended: bool,
    pub losses: u64,
    pub remarks: u64,
    pub open_files: usize,
    pub upstream: Option<UpstreamHealth>,
}

/// Upstream connection health, present when an upstream is configured.
#[derive(Debug, Clone)]
pub struct UpstreamHealth {
    pub failure_count: u64,
    pub millis_since_success: Option<u64>,
}
